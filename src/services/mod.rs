pub mod cart;
pub mod checkout;
pub mod invoice;
pub mod metrics;
pub mod notify;
pub mod razorpay;
pub mod refund;
pub mod repository;

pub use metrics::{get_metrics, init_metrics};
