use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::info;

use crate::{
    greet::types::{GreetResult, Greeting},
    CallContext, MessageReceiver, MessageSender, RpcConfig, RpcError, RpcServer,
};

pub const GREET: &str = "GreetService.Greet";
pub const GREET_MANY_TIMES: &str = "GreetService.GreetManyTimes";
pub const LONG_GREET: &str = "GreetService.LongGreet";
pub const GREET_EVERYONE: &str = "GreetService.GreetEveryone";
pub const GREET_WITH_DEADLINE: &str = "GreetService.GreetWithDeadline";

/// `"hello {first} {last}"`, or `"hello {first}"` when there is no last name.
pub fn format_greeting(greeting: &Greeting) -> String {
    match greeting.last_name.as_deref() {
        Some(last) if !last.is_empty() => format!("hello {} {}", greeting.first_name, last),
        _ => format!("hello {}", greeting.first_name),
    }
}

/// Handler trait that users implement for the greet service.
#[async_trait]
pub trait GreetServiceHandler: Send + Sync + 'static {
    async fn greet(&self, greeting: Greeting, context: CallContext) -> Result<GreetResult, RpcError>;

    async fn greet_many_times(
        &self,
        greeting: Greeting,
        responses: MessageSender<GreetResult>,
        context: CallContext,
    ) -> Result<(), RpcError>;

    async fn long_greet(
        &self,
        greetings: MessageReceiver<Greeting>,
        context: CallContext,
    ) -> Result<GreetResult, RpcError>;

    async fn greet_everyone(
        &self,
        greetings: MessageReceiver<Greeting>,
        responses: MessageSender<GreetResult>,
        context: CallContext,
    ) -> Result<(), RpcError>;

    async fn greet_with_deadline(
        &self,
        greeting: Greeting,
        context: CallContext,
    ) -> Result<GreetResult, RpcError>;
}

/// Server that registers a [`GreetServiceHandler`] under the `GreetService.*` methods.
pub struct GreetServiceServer<H: GreetServiceHandler> {
    handler: Arc<H>,
    rpc_server: RpcServer,
}

impl<H: GreetServiceHandler> GreetServiceServer<H> {
    pub fn new(handler: H, config: RpcConfig) -> Self {
        Self {
            handler: Arc::new(handler),
            rpc_server: RpcServer::new(config),
        }
    }

    pub fn rpc_server(&self) -> &RpcServer {
        &self.rpc_server
    }

    pub async fn register_all(&self) {
        let handler = self.handler.clone();
        self.rpc_server
            .register_unary(GREET, move |greeting: Greeting, context: CallContext| {
                let handler = handler.clone();
                async move { handler.greet(greeting, context).await }
            })
            .await;

        let handler = self.handler.clone();
        self.rpc_server
            .register_server_streaming(
                GREET_MANY_TIMES,
                move |greeting: Greeting, responses: MessageSender<GreetResult>, context: CallContext| {
                    let handler = handler.clone();
                    async move { handler.greet_many_times(greeting, responses, context).await }
                },
            )
            .await;

        let handler = self.handler.clone();
        self.rpc_server
            .register_client_streaming(
                LONG_GREET,
                move |greetings: MessageReceiver<Greeting>, context: CallContext| {
                    let handler = handler.clone();
                    async move { handler.long_greet(greetings, context).await }
                },
            )
            .await;

        let handler = self.handler.clone();
        self.rpc_server
            .register_bidi_streaming(
                GREET_EVERYONE,
                move |greetings: MessageReceiver<Greeting>,
                      responses: MessageSender<GreetResult>,
                      context: CallContext| {
                    let handler = handler.clone();
                    async move { handler.greet_everyone(greetings, responses, context).await }
                },
            )
            .await;

        let handler = self.handler.clone();
        self.rpc_server
            .register_unary(GREET_WITH_DEADLINE, move |greeting: Greeting, context: CallContext| {
                let handler = handler.clone();
                async move { handler.greet_with_deadline(greeting, context).await }
            })
            .await;
    }

    /// Registers every method, binds and serves until the transport shuts down.
    pub async fn serve(mut self) -> Result<(), RpcError> {
        self.register_all().await;
        let quic_server = self.rpc_server.bind()?;
        info!("Server listening on: {:?}", self.rpc_server.socket_addr);
        self.rpc_server.start(quic_server).await
    }
}

/// The reference greet service.
#[derive(Debug, Clone)]
pub struct Greeter {
    repeat: u32,
    pacing: Duration,
    work_steps: u32,
    work_unit: Duration,
}

impl Default for Greeter {
    fn default() -> Self {
        Self {
            repeat: 10,
            pacing: Duration::from_secs(1),
            work_steps: 3,
            work_unit: Duration::from_secs(1),
        }
    }
}

impl Greeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of responses sent by GreetManyTimes.
    pub fn with_repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }

    /// Pause between two GreetManyTimes responses.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_work_steps(mut self, steps: u32) -> Self {
        self.work_steps = steps;
        self
    }

    /// Length of one GreetWithDeadline work step.
    pub fn with_work_unit(mut self, unit: Duration) -> Self {
        self.work_unit = unit;
        self
    }
}

#[async_trait]
impl GreetServiceHandler for Greeter {
    async fn greet(&self, greeting: Greeting, _context: CallContext) -> Result<GreetResult, RpcError> {
        info!("Greet was invoked with {:?}", greeting);
        Ok(GreetResult::new(format_greeting(&greeting)))
    }

    async fn greet_many_times(
        &self,
        greeting: Greeting,
        mut responses: MessageSender<GreetResult>,
        context: CallContext,
    ) -> Result<(), RpcError> {
        info!("GreetManyTimes was invoked with {:?}", greeting);
        for i in 0..self.repeat {
            if i > 0 {
                context.sleep(self.pacing).await?;
            }
            let result = format!("hello {} number {}", greeting.first_name, i);
            responses.send(GreetResult::new(result)).await?;
        }
        Ok(())
    }

    async fn long_greet(
        &self,
        mut greetings: MessageReceiver<Greeting>,
        _context: CallContext,
    ) -> Result<GreetResult, RpcError> {
        info!("LongGreet was invoked with a streaming request");
        let mut result = String::new();
        while let Some(greeting) = greetings.receive().await? {
            result.push_str(&format!("hello {}!", greeting.first_name));
        }
        Ok(GreetResult::new(result))
    }

    async fn greet_everyone(
        &self,
        mut greetings: MessageReceiver<Greeting>,
        mut responses: MessageSender<GreetResult>,
        _context: CallContext,
    ) -> Result<(), RpcError> {
        info!("GreetEveryone was invoked with a streaming request");
        while let Some(greeting) = greetings.receive().await? {
            let result = format!("hello {} !", greeting.first_name);
            responses.send(GreetResult::new(result)).await?;
        }
        Ok(())
    }

    async fn greet_with_deadline(
        &self,
        greeting: Greeting,
        context: CallContext,
    ) -> Result<GreetResult, RpcError> {
        info!("GreetWithDeadline was invoked with {:?}", greeting);
        for _ in 0..self.work_steps {
            if let Err(err) = context.sleep(self.work_unit).await {
                if matches!(err, RpcError::Canceled) {
                    info!("the client canceled the request");
                }
                return Err(err);
            }
        }
        Ok(GreetResult::new(format_greeting(&greeting)))
    }
}
