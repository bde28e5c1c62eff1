//! The narrow browser surface the distiller and executor depend on.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::action::ScrollDirection;
use crate::error::DriverError;

/// How a lookup treats an address that matches several live nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Fail with [`DriverError::Ambiguous`] unless exactly one node matches.
    Strict,
    /// Operate on the first match in document order.
    FirstMatch,
}

/// An element address plus the lookup policy to use for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub address: String,
    pub strictness: Strictness,
}

impl Target {
    pub fn strict(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            strictness: Strictness::Strict,
        }
    }

    pub fn first_match(self) -> Self {
        Self {
            strictness: Strictness::FirstMatch,
            ..self
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strictness == Strictness::Strict
    }
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    async fn click(&self, target: &Target) -> Result<(), DriverError>;

    /// Focus the element and type into it, replacing its current value.
    async fn type_text(&self, target: &Target, text: &str) -> Result<(), DriverError>;

    async fn press_key(&self, key: &str) -> Result<(), DriverError>;

    async fn select(&self, target: &Target, value: &str) -> Result<(), DriverError>;

    async fn scroll(&self, direction: ScrollDirection) -> Result<(), DriverError>;

    async fn go_back(&self) -> Result<(), DriverError>;

    /// Render the page to a PNG file at `path`.
    async fn screenshot(&self, path: &Path) -> Result<(), DriverError>;

    /// Current page markup.
    async fn content(&self) -> Result<String, DriverError>;

    async fn current_url(&self) -> Result<String, DriverError>;

    async fn title(&self) -> Result<String, DriverError>;

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError>;

    /// Tear the session down. Called on cancellation.
    async fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

#[async_trait]
impl<T: BrowserDriver + ?Sized> BrowserDriver for Arc<T> {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        (**self).navigate(url).await
    }

    async fn click(&self, target: &Target) -> Result<(), DriverError> {
        (**self).click(target).await
    }

    async fn type_text(&self, target: &Target, text: &str) -> Result<(), DriverError> {
        (**self).type_text(target, text).await
    }

    async fn press_key(&self, key: &str) -> Result<(), DriverError> {
        (**self).press_key(key).await
    }

    async fn select(&self, target: &Target, value: &str) -> Result<(), DriverError> {
        (**self).select(target, value).await
    }

    async fn scroll(&self, direction: ScrollDirection) -> Result<(), DriverError> {
        (**self).scroll(direction).await
    }

    async fn go_back(&self) -> Result<(), DriverError> {
        (**self).go_back().await
    }

    async fn screenshot(&self, path: &Path) -> Result<(), DriverError> {
        (**self).screenshot(path).await
    }

    async fn content(&self) -> Result<String, DriverError> {
        (**self).content().await
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        (**self).current_url().await
    }

    async fn title(&self) -> Result<String, DriverError> {
        (**self).title().await
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        (**self).evaluate(script).await
    }

    async fn close(&self) -> Result<(), DriverError> {
        (**self).close().await
    }
}
