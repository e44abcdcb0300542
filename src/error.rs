use crate::addr::Ipv4Address;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StackError {
    #[error("adapter destroyed")]
    AdapterDestroyed,

    #[error("listener already registered on {0}:{1}")]
    ListenerExists(Ipv4Address, u16),

    #[error("connection already registered: {0}")]
    ConnectionExists(String),

    #[error("socket is closed")]
    SocketClosed,

    #[error("no device owns {0}")]
    NoRoute(Ipv4Address),

    #[error("address pool exhausted for subnet of {network}")]
    PoolExhausted { network: Ipv4Address },

    #[error("invalid address literal: {0}")]
    InvalidAddress(String),

    #[error("internal invariant violated: {0}")]
    Invariant(&'static str),
}
