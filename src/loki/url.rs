use tracing::error;
use url::Url;

pub const READY_ENDPOINT: &str = "ready";
pub const QUERY_RANGE_ENDPOINT: &str = "loki/api/v1/query_range";
pub const TAIL_ENDPOINT: &str = "loki/api/v1/tail";

/// Composes the URL for one Loki endpoint from a validated base URL.
///
/// The path is the prefix, the base URL's own path and the endpoint joined
/// with exactly one `/` between segments. Supplied query parameters replace
/// any colliding parameters already present on the base URL. The tail
/// endpoint is served over a websocket, so its scheme is rewritten
/// `http -> ws` / `https -> wss`.
pub fn endpoint_url(base: &Url, prefix: &str, endpoint: &str, params: &[(&str, String)]) -> Url {
    let mut url = base.clone();
    url.set_path(&join_path(prefix, base.path(), endpoint));

    if !params.is_empty() {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| params.iter().all(|(new_name, _)| new_name != name))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (name, value) in &kept {
            pairs.append_pair(name, value);
        }
        for (name, value) in params {
            pairs.append_pair(name, value);
        }
        drop(pairs);
    }

    if endpoint == TAIL_ENDPOINT {
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        if url.set_scheme(scheme).is_err() {
            // unreachable: the resolver only admits http and https
            error!(url = %url, "failed to switch scheme for the tail endpoint");
        }
    }

    url
}

fn join_path(prefix: &str, base_path: &str, endpoint: &str) -> String {
    let mut path = String::from("/");
    for segment in [prefix, base_path, endpoint] {
        let trimmed = segment.trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        if !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(trimmed);
    }
    path
}
