//! A minimal JVM: resolves classes from a classpath and interprets the
//! bytecode of their `main` method on a frame-based stack machine.
pub mod bytecode;
pub mod classpath;
pub mod intrinsics;
pub mod jvm;
pub mod program;
pub mod runtime;

#[cfg(test)]
mod testing;

pub use classpath::{ClassLoader, Classpath};
pub use runtime::{run, Runtime, RuntimeError};
