//! The client walkthrough: one call of every pattern, then the deadline pair.

use std::time::Duration;

use futures::TryStreamExt;
use tokio::time;
use tracing::{info, warn};

use crate::{
    greet::{
        client::GreetServiceClient,
        types::{GreetResult, Greeting},
    },
    Code, RpcError,
};

/// How a GreetWithDeadline call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadlineOutcome {
    Completed(String),
    TimedOut,
    Failed(Code),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoReport {
    pub unary: String,
    pub server_streaming: Vec<String>,
    pub client_streaming: String,
    pub bidi_streaming: Vec<String>,
    pub generous_deadline: DeadlineOutcome,
    pub short_deadline: DeadlineOutcome,
}

#[derive(Debug, Clone)]
pub struct DemoPlan {
    /// Time unit the deadlines are expressed in; matches the server's work step.
    pub unit: Duration,
    pub roster: Vec<String>,
    /// Pause after each streamed request.
    pub send_pacing: Duration,
}

impl Default for DemoPlan {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl DemoPlan {
    pub fn new(unit: Duration) -> Self {
        Self {
            unit,
            roster: ["rohan", "jayant", "shyam", "mohit"]
                .into_iter()
                .map(String::from)
                .collect(),
            send_pacing: unit,
        }
    }

    pub fn with_send_pacing(mut self, pacing: Duration) -> Self {
        self.send_pacing = pacing;
        self
    }

    pub fn with_roster<I, S>(mut self, roster: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roster = roster.into_iter().map(Into::into).collect();
        self
    }

    /// Runs every demonstration in order.
    ///
    /// Status errors of the deadline calls are reported in the outcome; any
    /// other error aborts the run.
    pub async fn run(&self, client: &GreetServiceClient) -> Result<DemoReport, RpcError> {
        let unary = self.unary(client).await?;
        let server_streaming = self.server_streaming(client).await?;
        let client_streaming = self.client_streaming(client).await?;
        let bidi_streaming = self.bidi_streaming(client).await?;
        let generous_deadline = self.unary_with_deadline(client, self.unit * 5).await?;
        let short_deadline = self.unary_with_deadline(client, self.unit).await?;

        Ok(DemoReport {
            unary,
            server_streaming,
            client_streaming,
            bidi_streaming,
            generous_deadline,
            short_deadline,
        })
    }

    async fn unary(&self, client: &GreetServiceClient) -> Result<String, RpcError> {
        info!("starting unary RPC");
        let response = client.greet(rohan_yadav()).await?;
        info!("Response from greet: {}", response.result);
        Ok(response.result)
    }

    async fn server_streaming(&self, client: &GreetServiceClient) -> Result<Vec<String>, RpcError> {
        info!("starting server streaming RPC");
        let responses = client.greet_many_times(rohan_yadav()).await?.into_stream();
        responses
            .inspect_ok(|response| info!("Response from GreetManyTimes: {}", response.result))
            .map_ok(|response| response.result)
            .try_collect()
            .await
    }

    async fn client_streaming(&self, client: &GreetServiceClient) -> Result<String, RpcError> {
        info!("starting client streaming RPC");
        let mut call = client.long_greet().await?;
        for name in &self.roster {
            info!("sending {}", name);
            call.send(Greeting::new(name.as_str())).await?;
            time::sleep(self.send_pacing).await;
        }
        let response = call.close_and_receive().await?;
        info!("LongGreet response: {}", response.result);
        Ok(response.result)
    }

    async fn bidi_streaming(&self, client: &GreetServiceClient) -> Result<Vec<String>, RpcError> {
        info!("starting bidirectional streaming RPC");
        let (mut greetings, mut responses) = client.greet_everyone().await?.split();

        let roster = self.roster.clone();
        let pacing = self.send_pacing;
        let sender = tokio::spawn(async move {
            for name in roster {
                info!("sending {}", name);
                greetings.send(Greeting::new(name)).await?;
                time::sleep(pacing).await;
            }
            greetings.close();
            Ok::<_, RpcError>(())
        });

        let receiver = tokio::spawn(async move {
            let mut results = Vec::new();
            while let Some(GreetResult { result }) = responses.receive().await? {
                info!("received: {}", result);
                results.push(result);
            }
            Ok::<_, RpcError>(results)
        });

        let (sent, received) = tokio::join!(sender, receiver);
        sent.map_err(join_error)??;
        received.map_err(join_error)?
    }

    async fn unary_with_deadline(
        &self,
        client: &GreetServiceClient,
        timeout: Duration,
    ) -> Result<DeadlineOutcome, RpcError> {
        info!("starting unary RPC with a {:?} deadline", timeout);
        match client.greet_with_deadline(rohan_yadav(), timeout).await {
            Ok(response) => {
                info!("Response from GreetWithDeadline: {}", response.result);
                Ok(DeadlineOutcome::Completed(response.result))
            }
            Err(err) => match err.status_code() {
                Some(Code::DeadlineExceeded) => {
                    warn!("Timeout! deadline was exceeded");
                    Ok(DeadlineOutcome::TimedOut)
                }
                Some(code) => {
                    warn!("Unexpected error: {}", err);
                    Ok(DeadlineOutcome::Failed(code))
                }
                None => Err(err),
            },
        }
    }
}

fn rohan_yadav() -> Greeting {
    Greeting::new("Rohan").with_last_name("Yadav")
}

fn join_error(err: tokio::task::JoinError) -> RpcError {
    RpcError::InternalError(format!("demo task failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::greet::{GreetServiceServer, Greeter};
    use crate::RpcConfig;

    async fn serve(greeter: Greeter) -> GreetServiceClient {
        let server = GreetServiceServer::new(greeter, RpcConfig::new("unused.pem", "127.0.0.1:0"));
        server.register_all().await;
        GreetServiceClient::new(server.rpc_server().clone().serve_in_memory())
    }

    #[tokio::test(start_paused = true)]
    async fn full_walkthrough_reports_every_pattern() {
        let client = serve(Greeter::new()).await;
        let report = DemoPlan::default().run(&client).await.unwrap();

        assert_eq!(report.unary, "hello Rohan Yadav");
        assert_eq!(report.server_streaming.len(), 10);
        assert_eq!(report.server_streaming[9], "hello Rohan number 9");
        assert_eq!(
            report.client_streaming,
            "hello rohan!hello jayant!hello shyam!hello mohit!"
        );
        assert_eq!(
            report.bidi_streaming,
            vec!["hello rohan !", "hello jayant !", "hello shyam !", "hello mohit !"]
        );
        assert_eq!(
            report.generous_deadline,
            DeadlineOutcome::Completed("hello Rohan Yadav".to_string())
        );
        assert_eq!(report.short_deadline, DeadlineOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_roster_flows_through_both_streaming_calls() {
        let client = serve(Greeter::new().with_repeat(2)).await;
        let plan = DemoPlan::new(Duration::from_millis(100))
            .with_roster(["ana"])
            .with_send_pacing(Duration::ZERO);
        let report = plan.run(&client).await.unwrap();

        assert_eq!(report.client_streaming, "hello ana!");
        assert_eq!(report.bidi_streaming, vec!["hello ana !"]);
        // The server still works in 1s steps, so both deadlines expire.
        assert_eq!(report.generous_deadline, DeadlineOutcome::TimedOut);
        assert_eq!(report.short_deadline, DeadlineOutcome::TimedOut);
    }
}
