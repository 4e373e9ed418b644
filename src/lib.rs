//! KnitScript: a knitting-pattern language compiled to knitout through a
//! virtual V-bed knitting machine.
//!
//! source → `dsl::lexer` → `dsl::parser` → `interpreter` → knitout lines

pub mod carriage_pass;
pub mod dat;
pub mod dsl;
pub mod error;
pub mod interpreter;
pub mod knit_graph;
pub mod knitout;
pub mod machine;
pub mod paths;
pub mod settings;
pub mod sheet;

pub use error::{ErrorKind, KnitError, KnitWarning};
pub use interpreter::{KnitScriptInterpreter, RunResult};
pub use settings::{InterpreterSettings, MachineSpec, XferPolicy};
