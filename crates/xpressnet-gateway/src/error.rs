use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("command station not connected")]
    NotConnected,
    #[error("serial transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] xpressnet::EncodeError),
}
