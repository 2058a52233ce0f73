pub mod channels;
pub mod codec;
pub mod dispatcher;
pub mod layer;
pub mod producer;
pub mod registry;
pub mod ring;
pub mod server;
pub mod session;
pub mod support;
