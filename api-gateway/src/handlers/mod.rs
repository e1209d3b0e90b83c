pub mod devices;
pub mod fulfillment;
pub mod health;
