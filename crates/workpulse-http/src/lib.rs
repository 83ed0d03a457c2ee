//! Centralized HTTP client for the WorkPulse agent
//!
//! Provides a mockable, configurable HTTP client wrapper plus the retry
//! policy used by the update engine.
//!
//! ## Features
//!
//! - **Trait-based design**: Mockable via `HttpClientTrait`
//! - **Configurable**: Timeouts, proxy, user-agent
//! - **Retry policy**: Exponential backoff with a delay cap and cancellation
//! - **Testing support**: Easy mocking with wiremock

pub mod client;
pub mod config;
pub mod error;
pub mod retry;

pub use client::{shared_client, HttpClient, HttpClientTrait};
pub use config::HttpConfig;
pub use error::{HttpError, Result};
pub use retry::{RetryConfig, RetryError, RetryMiddleware, Retryable};

/// Re-export commonly used types
pub use reqwest::{header, Method, Response, StatusCode};
