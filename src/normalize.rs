//! Source URL checks: which links the backend accepts, and the canonical watch form it expects.

use url::Url;

const ACCEPTED_HOSTS: [&str; 3] = ["youtube.com", "www.youtube.com", "youtu.be"];
const SHORT_HOST: &str = "youtu.be";
const CANONICAL_WATCH: &str = "https://youtube.com/watch";

pub fn validate(url: &str) -> bool {
  match Url::parse(url) {
    Ok(u) => u
      .host_str()
      .map(|h| ACCEPTED_HOSTS.contains(&h))
      .unwrap_or(false),
    Err(_) => false,
  }
}

/// Rewrites `youtu.be/<id>` and `youtube.com/watch?v=<id>&...` to `https://youtube.com/watch?v=<id>`.
/// Anything it does not recognize, including unparseable input, is returned unchanged.
pub fn normalize(url: &str) -> String {
  let Ok(parsed) = Url::parse(url) else {
    return url.to_string();
  };
  let Some(host) = parsed.host_str() else {
    return url.to_string();
  };
  if !(host.contains("youtube.com") || host.contains(SHORT_HOST)) {
    return url.to_string();
  }

  let video_id = if host == SHORT_HOST {
    parsed
      .path_segments()
      .and_then(|mut s| s.next())
      .filter(|s| !s.is_empty())
      .map(|s| s.to_string())
  } else {
    parsed
      .query_pairs()
      .find(|(k, _)| k == "v")
      .map(|(_, v)| v.into_owned())
      .filter(|v| !v.is_empty())
  };

  match video_id {
    Some(id) => format!("{CANONICAL_WATCH}?v={id}"),
    None => url.to_string(),
  }
}
