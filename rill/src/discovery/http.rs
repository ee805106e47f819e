use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Mutex,
    time::Duration,
};
use bytes::Buf;
use url::Url;
use serde::de;
use serde_derive::Deserialize;
use crate::ID;
use super::{Discovery, DiscoveryError, Result};

// A single HTTP tracker.
pub struct HttpTracker {

    client: reqwest::Client,

    url: Url,

    client_id: ID,

    // Port announced while fetching, before we listen ourselves.
    port: u16,

    state: Mutex<TrackerState>,

}

#[derive(Debug, Default)]
struct TrackerState {

    // Sent back on later announces if the tracker gave us one.
    tracker_id: Option<String>,

    interval: Option<Duration>,

    started: bool,

}

impl HttpTracker {

    pub fn new(url: Url, client_id: ID, port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            client_id,
            port,
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn announce_url(&self, info_hash: &ID, port: u16, left: u64) -> String {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
            self.url.as_str(),
            urlencoding::encode_binary(info_hash),
            urlencoding::encode_binary(&self.client_id),
            port,
            left,
        );
        if let Ok(mut state) = self.state.lock() {
            if !state.started {
                url.push_str("&event=started");
                state.started = true;
            }
            if let Some(tracker_id) = &state.tracker_id {
                url.push_str(&format!("&trackerid={}", urlencoding::encode(tracker_id)));
            }
        }
        url
    }

    async fn request(&self, url: String) -> Result<Vec<SocketAddr>> {
        tracing::debug!("announce url: {}", url);

        let raw_resp = self.client
            .get(url)
            .send()
            .await?
            .bytes()
            .await?;
        self.process_response(&raw_resp)
    }

    // Keeps the interval and tracker id for later announces, returns the peers.
    fn process_response(&self, raw_resp: &[u8]) -> Result<Vec<SocketAddr>> {
        let resp: HttpResponse = serde_bencode::from_bytes(raw_resp)?;
        tracing::debug!("announce response: {:#?}", resp);

        if let Some(failure) = resp.failure_reason {
            return Err(DiscoveryError::ResponseError(failure));
        }
        if let Some(warning) = resp.warning_message {
            tracing::warn!("warning: {}", warning);
        }

        if let Ok(mut state) = self.state.lock() {
            if let Some(interval) = resp.interval {
                state.interval = Some(Duration::from_secs(interval));
            }
            if let Some(tracker_id) = resp.tracker_id {
                state.tracker_id = Some(tracker_id);
            }
        }

        Ok(resp.peers)
    }
}

#[async_trait::async_trait]
impl Discovery for HttpTracker {

    async fn find_peers(&self, info_hash: ID) -> Result<Vec<SocketAddr>> {
        // Amount left is unknown here, any non-zero value marks us as a leecher.
        let url = self.announce_url(&info_hash, self.port, 1);
        self.request(url).await
    }

    async fn announce(&self, info_hash: ID, port: u16) -> Result<()> {
        let url = self.announce_url(&info_hash, port, 0);
        self.request(url).await.map(|_| ())
    }

    // Interval from the last response.
    fn interval(&self) -> Option<Duration> {
        self.state.lock().ok().and_then(|s| s.interval)
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct HttpResponse {

    // If present, then no other keys may be present.
    #[serde(default)]
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    // The response still gets processed normally.
    #[serde(default)]
    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,

    // Interval in seconds that the client should wait between sending regular requests to the tracker
    #[serde(default)]
    pub interval: Option<u64>,

    #[serde(default)]
    #[serde(rename = "tracker id")]
    pub tracker_id: Option<String>,

    #[serde(default)]
    #[serde(deserialize_with = "peer_deserialize")]
    pub peers: Vec<SocketAddr>,
}

// The tracker can either return a dictionary model or a compacted string,
// whatever we asked for.
fn peer_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string of bytes or a list of dictionaries")
        }

        // 4 bytes of IP followed by 2 bytes of port, big-endian.
        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("peer string not multiple of 6"));
            }

            let mut peers = Vec::with_capacity(v.len() / 6);
            while v.has_remaining() {
                peers.push(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                    v.get_u16(),
                ));
            }
            Ok(peers)
        }

        // A list of dictionaries, each with the keys "ip" and "port".
        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                match peer.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, peer.port)),
                    Err(_) => tracing::debug!("skipping peer with unparseable ip: {}", peer.ip),
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}
