pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{CapabilityDescriptor, CapabilityRegistry, Tool, ToolOutput};
pub use schema::plan_schema_json;
