pub mod constants;
pub mod errors;
pub mod managers;
pub mod model;
pub mod services;
pub mod stores;
pub mod utils;
