pub mod headers;
pub mod script;
pub mod session;

// Re-export common types
pub use headers::{HeaderProvider, HeaderSet};
pub use script::{RenderPlan, RenderStep};
pub use session::{RenderTransport, RenderedPage, TransportError, WebDriverTransport};
