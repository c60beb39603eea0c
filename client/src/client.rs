use tracing::debug;

use tether_protocol::{Declare, Value};
use tether_std::errors::Result;

use crate::blocking::BlockingPool;
use crate::config::ClientConfig;
use crate::pool::AsyncPool;
use crate::request::Request;

/// Multiplexing client over the asynchronous pool.
pub struct Client {
    config: ClientConfig,
    pool: AsyncPool,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            pool: AsyncPool::new(config.clone()),
            config,
        }
    }

    /// Invoke a registered method with already-bound positional arguments.
    pub async fn dispatch(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let request = Request::new(method, args);
        let mut remaining = self.config.max_retry;
        if remaining == 0 {
            return self.pool.dispatch_request(&request).await;
        }

        loop {
            match self.pool.dispatch_request(&request).await {
                Err(err) if err.is_transport() => {
                    remaining -= 1;
                    debug!(error = %err, remaining, "transport failure");
                    if remaining == 0 {
                        return Err(err);
                    }
                }
                outcome => return outcome,
            }
        }
    }

    /// Invoke through a declare, binding and coercing arguments locally
    /// before anything touches the wire.
    pub async fn call(&self, declare: &Declare, args: Vec<Value>) -> Result<Value> {
        let bound = declare.bind(args)?;
        self.dispatch(declare.name(), bound).await
    }
}

/// Serialized request/response client over the blocking pool.
pub struct BlockingClient {
    config: ClientConfig,
    pool: BlockingPool,
}

impl BlockingClient {
    /// Connects eagerly, like the pool underneath.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            pool: BlockingPool::new(config.clone())?,
            config,
        })
    }

    pub fn dispatch(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let request = Request::new(method, args);
        let mut remaining = self.config.max_retry;
        if remaining == 0 {
            return self.pool.dispatch_request(&request);
        }

        loop {
            match self.pool.dispatch_request(&request) {
                Err(err) if err.is_transport() => {
                    remaining -= 1;
                    debug!(error = %err, remaining, "transport failure");
                    if remaining == 0 {
                        return Err(err);
                    }
                }
                outcome => return outcome,
            }
        }
    }

    pub fn call(&self, declare: &Declare, args: Vec<Value>) -> Result<Value> {
        let bound = declare.bind(args)?;
        self.dispatch(declare.name(), bound)
    }
}
