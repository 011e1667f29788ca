use std::{net::SocketAddr, time::Duration};

use crate::{
    greet::{
        server::{GREET, GREET_EVERYONE, GREET_MANY_TIMES, GREET_WITH_DEADLINE, LONG_GREET},
        types::{GreetResult, Greeting},
    },
    Call, CallContext, MessageReceiver, RpcClient, RpcConfig, RpcError,
};

/// Client for calling greet service methods.
#[derive(Clone)]
pub struct GreetServiceClient {
    inner: RpcClient,
}

impl GreetServiceClient {
    /// Connects to the service at the given address.
    pub async fn connect(addr: SocketAddr, config: RpcConfig) -> Result<Self, RpcError> {
        let inner = RpcClient::connect(addr, config).await?;
        Ok(Self { inner })
    }

    pub fn new(inner: RpcClient) -> Self {
        Self { inner }
    }

    pub async fn greet(&self, greeting: Greeting) -> Result<GreetResult, RpcError> {
        self.inner.unary(GREET, greeting, CallContext::new()).await
    }

    pub async fn greet_many_times(
        &self,
        greeting: Greeting,
    ) -> Result<MessageReceiver<GreetResult>, RpcError> {
        self.inner
            .server_streaming(GREET_MANY_TIMES, greeting, CallContext::new())
            .await
    }

    pub async fn long_greet(&self) -> Result<Call<Greeting, GreetResult>, RpcError> {
        self.inner.client_streaming(LONG_GREET, CallContext::new()).await
    }

    pub async fn greet_everyone(&self) -> Result<Call<Greeting, GreetResult>, RpcError> {
        self.inner.bidi_streaming(GREET_EVERYONE, CallContext::new()).await
    }

    /// Calls GreetWithDeadline, giving up after `timeout`.
    pub async fn greet_with_deadline(
        &self,
        greeting: Greeting,
        timeout: Duration,
    ) -> Result<GreetResult, RpcError> {
        self.inner
            .unary(GREET_WITH_DEADLINE, greeting, CallContext::with_timeout(timeout))
            .await
    }
}
