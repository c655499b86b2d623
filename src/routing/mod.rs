mod matcher;

pub use matcher::{CompiledRoute, PathPattern, RouteStatsSnapshot, RouteTable};
