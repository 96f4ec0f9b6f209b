pub mod cfg;
pub mod ea;
pub mod interp;
pub mod program;
mod util;
