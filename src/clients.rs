pub mod feature_server;

pub use feature_server::{FeatureServerClient, FeatureServerConfig};
