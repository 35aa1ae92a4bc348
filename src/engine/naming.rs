use anyhow::Context;
use sanitize_filename::sanitize;
use std::path::Path;

/// Name to save an artifact under: the backend's name when it gave one, otherwise a
/// generic stem with an extension guessed from the content type.
pub fn artifact_filename(declared: Option<&str>, content_type: Option<&str>) -> String {
  if let Some(name) = declared.map(str::trim).filter(|n| !n.is_empty()) {
    return name.to_string();
  }

  let mut base = "download".to_string();
  if let Some(ct) = content_type {
    if let Some(ext) = mime_guess::get_mime_extensions_str(ct).and_then(|exts| exts.first().copied()) {
      base.push('.');
      base.push_str(ext);
    }
  }
  base
}

/// Filename from a Content-Disposition header. An RFC 5987 `filename*` wins over a plain
/// `filename`, wherever each appears in the header.
pub fn parse_content_disposition_filename(cd: &str) -> Option<String> {
  let mut plain = None;
  for param in split_params(cd) {
    let Some((key, value)) = param.split_once('=') else {
      continue;
    };
    let value = value.trim();
    match key.trim().to_ascii_lowercase().as_str() {
      "filename*" => {
        // charset'lang'percent-encoded
        let encoded = value.splitn(3, '\'').nth(2).unwrap_or(value).trim_matches('"');
        let decoded = percent_decode(encoded);
        if !decoded.is_empty() {
          return Some(decoded);
        }
      }
      "filename" if plain.is_none() => {
        let unquoted = value.trim_matches('"');
        if !unquoted.is_empty() {
          plain = Some(percent_decode(unquoted));
        }
      }
      _ => {}
    }
  }
  plain
}

fn percent_decode(s: &str) -> String {
  urlencoding::decode(s).map(|v| v.into_owned()).unwrap_or_else(|_| s.to_string())
}

// Splits on ';' outside double quotes.
fn split_params(header: &str) -> Vec<&str> {
  let mut params = Vec::new();
  let mut quoted = false;
  let mut start = 0;
  for (i, ch) in header.char_indices() {
    match ch {
      '"' => quoted = !quoted,
      ';' if !quoted => {
        params.push(&header[start..i]);
        start = i + 1;
      }
      _ => {}
    }
  }
  params.push(&header[start..]);
  params
}

/// Sanitized `desired`, numbered `name (n).ext` when something already sits at that path.
pub fn choose_non_colliding_filename(dest_dir: &Path, desired: &str) -> anyhow::Result<String> {
  let clean = sanitize(desired);
  let clean = if clean.is_empty() { "download".to_string() } else { clean };
  if !dest_dir.join(&clean).exists() {
    return Ok(clean);
  }

  let path = Path::new(&clean);
  let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(&clean);
  let ext = path.extension().and_then(|s| s.to_str());
  (1..=10_000)
    .map(|n| match ext {
      Some(ext) => format!("{stem} ({n}).{ext}"),
      None => format!("{stem} ({n})"),
    })
    .find(|candidate| !dest_dir.join(candidate).exists())
    .ok_or_else(|| anyhow::anyhow!("too many files named {clean}"))
}

pub fn ensure_dir(dest_dir: &Path) -> anyhow::Result<()> {
  std::fs::create_dir_all(dest_dir).context("failed to create destination dir")
}
