pub mod client;
pub mod generate;

pub use client::{ApiClient, ClientArgs};
pub use generate::{generate_to_file, run, GenerateArgs};
