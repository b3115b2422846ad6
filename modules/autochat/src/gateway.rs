// Gateway seam: everything the engine asks of the SMS gateway.
//
// The REST client implements it for production; `testing::MockGateway`
// implements it for tests, so no test touches the network.

use async_trait::async_trait;

use exagate_client::ExaGateClient;

use crate::error::Result;
use crate::types::{Ack, Identity, InboundEvent, RouteHandle};

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Current SIM directory.
    async fn list_identities(&self) -> Result<Vec<Identity>>;

    /// Send `text` from the SIM behind `route` to `to`.
    async fn send(&self, route: &RouteHandle, to: &str, text: &str) -> Result<Ack>;

    /// Inbound messages, in any order.
    async fn list_inbound(&self) -> Result<Vec<InboundEvent>>;
}

#[async_trait]
impl Gateway for ExaGateClient {
    async fn list_identities(&self) -> Result<Vec<Identity>> {
        Ok(self.list_identities().await?)
    }

    async fn send(&self, route: &RouteHandle, to: &str, text: &str) -> Result<Ack> {
        Ok(self.send(route, to, text).await?)
    }

    async fn list_inbound(&self) -> Result<Vec<InboundEvent>> {
        Ok(self.list_inbound().await?)
    }
}
