//! Seam to the data-path collaborator that owns sockets.
//!
//! The conductor only decides which endpoints exist. Whatever moves bytes
//! (sender and receiver loops, log buffers) hears about each endpoint through
//! [`ChannelTransport`] and may refuse one, which the conductor reports back
//! to the client as a channel endpoint error.

use crate::error::Result;
use crate::uri::ResolvedEndpoint;

/// Endpoint lifecycle events, called from the conductor thread.
pub trait ChannelTransport: Send {
    /// A send endpoint was created for a UDP publication.
    ///
    /// # Errors
    ///
    /// Any error refuses the endpoint; the publication is not created.
    fn on_send_endpoint_created(&mut self, endpoint: &ResolvedEndpoint) -> Result<()> {
        let _ = endpoint;
        Ok(())
    }

    fn on_send_endpoint_closed(&mut self, endpoint: &ResolvedEndpoint) {
        let _ = endpoint;
    }

    /// A receive endpoint was created for a UDP subscription.
    ///
    /// # Errors
    ///
    /// Any error refuses the endpoint; the subscription is not created.
    fn on_receive_endpoint_created(&mut self, endpoint: &ResolvedEndpoint) -> Result<()> {
        let _ = endpoint;
        Ok(())
    }

    fn on_receive_endpoint_closed(&mut self, endpoint: &ResolvedEndpoint) {
        let _ = endpoint;
    }

    fn on_destination_added(&mut self, endpoint: &ResolvedEndpoint, destination: &ResolvedEndpoint) {
        let _ = (endpoint, destination);
    }

    fn on_destination_removed(&mut self, endpoint: &ResolvedEndpoint, destination: &ResolvedEndpoint) {
        let _ = (endpoint, destination);
    }

    fn on_rcv_destination_added(&mut self, endpoint: &ResolvedEndpoint, destination: &ResolvedEndpoint) {
        let _ = (endpoint, destination);
    }

    fn on_rcv_destination_removed(
        &mut self,
        endpoint: &ResolvedEndpoint,
        destination: &ResolvedEndpoint,
    ) {
        let _ = (endpoint, destination);
    }
}

/// Accepts every endpoint and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTransport;

impl ChannelTransport for NoOpTransport {}
