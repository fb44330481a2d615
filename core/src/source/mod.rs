mod source_trait;
mod static_source;
mod zipkin;

pub use source_trait::{BackendDependencyLink, SourceError, TraceSource};
pub use static_source::StaticTraceSource;
pub use zipkin::{parse_span, parse_spans, parse_traces, ZipkinClient};
