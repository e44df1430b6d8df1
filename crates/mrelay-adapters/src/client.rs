use std::sync::Arc;

use dashmap::DashMap;
use std::sync::OnceLock;
use wreq::Proxy;

use crate::error::{RelayError, RelayResult};

/// Clients are cached per outbound proxy URL; channels without a proxy share
/// one direct client. Connection pools live as long as the process.
static CLIENTS: OnceLock<DashMap<String, Arc<wreq::Client>>> = OnceLock::new();

const DIRECT: &str = "";

pub fn client_for_proxy(proxy: Option<&str>) -> RelayResult<Arc<wreq::Client>> {
    let clients = CLIENTS.get_or_init(DashMap::new);
    let key = proxy.unwrap_or(DIRECT).to_string();
    if let Some(found) = clients.get(&key) {
        return Ok(found.clone());
    }

    let mut builder = wreq::Client::builder();
    if let Some(proxy_url) = proxy {
        let proxy = Proxy::all(proxy_url)
            .map_err(|err| RelayError::internal(format!("invalid channel proxy: {err}")))?;
        builder = builder.proxy(proxy);
    }
    let client = Arc::new(
        builder
            .build()
            .map_err(|err| RelayError::internal(format!("http client build failed: {err}")))?,
    );
    clients.insert(key, client.clone());
    Ok(client)
}
