#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    // Outbound only, waiting on the tcp connection.
    Connecting,
    Handshaking,
    // Handshake done, waiting for the remote's extension handshake.
    ExtensionHandshake,
    Steady,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether we are refusing the peer's requests.
    pub choked: bool,

    // Whether we are interested in the peer's pieces.
    pub interested: bool,

    // Whether the peer is refusing our requests.
    pub peer_choking: bool,

    // Whether the peer is interested in our pieces.
    pub peer_interested: bool,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Handshaking,
            choked: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

impl SessionState {

    #[inline(always)]
    pub fn update(&mut self, f: impl FnOnce(&mut SessionState)) {
        f(self);
        tracing::trace!("state: {:?}", self);
    }
}
