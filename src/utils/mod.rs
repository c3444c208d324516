pub mod logging;
pub mod order_id;
pub mod signature;

pub use logging::init_logging;
pub use order_id::{generate_client_order_id, generate_position_id, OrderIdGenerator};
pub use signature::SignatureHelper;
