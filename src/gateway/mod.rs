//! Gateway: namespaced aggregation, dispatch and the data planes

mod aggregator;
mod dispatcher;
mod router;
mod server;
mod stdio;

pub use aggregator::{
    Aggregation, AggregationWarning, NamespacedTool, SEPARATOR, find_connector,
    get_aggregated_tools, namespaced, parse_namespace,
};
pub use dispatcher::{Dispatcher, MAX_IN_FLIGHT, RouteTable};
pub use router::{AppState, create_router};
pub use server::{DataPlane, Gateway};
pub use stdio::serve_lines;
