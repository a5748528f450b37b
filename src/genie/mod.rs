//! 协调者：专家路由、子会话派发与会话链接登记

pub mod coordinator;
pub mod links;
pub mod sqlite;

pub use coordinator::{parse_routing, Genie, RoutingDecision, ROUTING_PURPOSE, SYNTHESIS_PURPOSE};
pub use links::{InMemoryLinkStore, LinkStatus, LinkStore, SessionLink, SessionLinkRegistry};
pub use sqlite::SqliteLinkStore;
