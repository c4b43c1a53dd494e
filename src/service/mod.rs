//! The out-of-process trace/logging service.

pub mod lifecycle;
pub mod logger;
pub mod minidump;
pub mod registration;
pub mod stack;
pub mod symbols;

pub use lifecycle::{Service, ServiceBackend, ServiceState, StopHandle, TransitionObserver};
pub use logger::{LoggerService, ServiceConfig};
pub use minidump::{write_minidump, MinidumpRequest};
pub use registration::ServiceRegistration;
pub use stack::{FramePointerWalker, StackWalker};
pub use symbols::{format_stack_trace, PassthroughSymbolizer, SymbolInfo, Symbolizer};
