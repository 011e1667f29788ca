//! The greet service: five methods covering every call pattern.

pub mod client;
pub mod driver;
pub mod server;
pub mod types;

pub use client::GreetServiceClient;
pub use driver::{DeadlineOutcome, DemoPlan, DemoReport};
pub use server::{format_greeting, GreetServiceHandler, GreetServiceServer, Greeter};
pub use types::{GreetResult, Greeting};
