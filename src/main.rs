use bela::runtime::DEFAULT_MAX_CALL_DEPTH;
use bela::{ClassLoader, Classpath, Runtime};
use clap::Parser;
use log::error;

#[derive(Parser)]
#[command(name = "bela", about = "Minimal JVM bytecode interpreter")]
struct Cli {
    /// Class file directories, separated like PATH entries
    #[arg(long, visible_alias = "cp", env = "CLASSPATH", default_value = ".")]
    classpath: String,
    /// Maximum number of nested method calls
    #[arg(long, default_value_t = DEFAULT_MAX_CALL_DEPTH)]
    max_call_depth: usize,
    /// Fully qualified name of the class whose `main` method is run
    main_class: String,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let classpath = Classpath::parse(&cli.classpath);
    let mut runtime =
        Runtime::new(ClassLoader::new(classpath)).with_max_call_depth(cli.max_call_depth);
    if let Err(e) = runtime.start(&cli.main_class) {
        error!("{} failed after {} instructions", cli.main_class, runtime.instructions_executed());
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
