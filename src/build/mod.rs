pub mod archive;
pub mod cancel;
pub mod compdb;
pub mod compiler;
pub mod freshness;
pub mod options;
pub mod phases;
pub mod pipeline;
pub mod recipe;

pub use cancel::CancelToken;
pub use compiler::{CompiledFile, Compiler};
pub use freshness::Freshness;
pub use phases::sizer::{SectionSize, SizeReport};
pub use pipeline::{BuildSummary, Builder};
pub use recipe::{ExecContext, OutputMode};
