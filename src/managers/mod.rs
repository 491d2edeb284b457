pub mod channel;
pub mod credentials;
pub mod dispatcher;
pub mod keys;
pub mod report;
