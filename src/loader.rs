use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;

const IPFS_GATEWAY: &str = "https://ipfs.io";

/// How many `<link rel="alternate">` hops to follow before giving up.
const MAX_LINK_HOPS: u32 = 5;

/// Opens a recording source as a byte stream: a filesystem path, `file://`
/// URL, `-` for stdin, `http(s)://`, or an ipfs location rewritten to a
/// public gateway.
pub fn open_source(location: &str) -> Result<Box<dyn BufRead>> {
    if location == "-" {
        return Ok(Box::new(BufReader::new(std::io::stdin())));
    }

    let location = rewrite_ipfs(location);

    if location.starts_with("http://") || location.starts_with("https://") {
        return open_http(&location, 0);
    }

    let path = location.strip_prefix("file://").unwrap_or(&location);
    let file = File::open(path).with_context(|| format!("failed to open {path}"))?;
    Ok(Box::new(BufReader::new(file)))
}

fn rewrite_ipfs(location: &str) -> String {
    if let Some(cid) = location.strip_prefix("ipfs://") {
        format!("{IPFS_GATEWAY}/ipfs/{cid}")
    } else if let Some(path) = location.strip_prefix("dweb:") {
        format!("{IPFS_GATEWAY}{path}")
    } else {
        location.to_string()
    }
}

fn open_http(url: &str, hops: u32) -> Result<Box<dyn BufRead>> {
    if hops > MAX_LINK_HOPS {
        bail!("too many alternate-link indirections while fetching {url}");
    }

    // gzip content-encoding is decompressed transparently by the client
    let response = reqwest::blocking::Client::builder()
        .build()?
        .get(url)
        .send()
        .with_context(|| format!("failed to fetch {url}"))?
        .error_for_status()
        .with_context(|| format!("failed to fetch {url}"))?;

    let final_url = response.url().clone();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("text/html") {
        let body = response.text()?;
        let href = find_alternate_link(&body).ok_or_else(|| {
            anyhow!(
                "<link rel=\"alternate\" type=\"application/x-asciicast\" href=\"...\"> \
                 not found in fetched HTML document"
            )
        })?;
        let next = final_url
            .join(&href)
            .with_context(|| format!("invalid alternate link {href}"))?;
        return open_http(next.as_str(), hops + 1);
    }

    Ok(Box::new(BufReader::new(response)))
}

/// Looks for `<link rel="alternate" type="application/x-asciicast"
/// href="...">` (or the older `application/asciicast+json` type) in an HTML
/// document.
fn find_alternate_link(html: &str) -> Option<String> {
    let link_tag = Regex::new(r"(?is)<link\b[^>]*>").expect("static regex");

    for tag in link_tag.find_iter(html) {
        let tag = tag.as_str();
        if attr_value(tag, "rel").as_deref() != Some("alternate") {
            continue;
        }
        match attr_value(tag, "type").as_deref() {
            Some("application/x-asciicast" | "application/asciicast+json") => {
                return attr_value(tag, "href");
            }
            _ => {}
        }
    }

    None
}

fn attr_value(tag: &str, name: &str) -> Option<String> {
    let pattern = format!(r#"(?i)\b{name}\s*=\s*["']([^"']*)["']"#);
    let re = Regex::new(&pattern).expect("static attribute regex");
    re.captures(tag).map(|caps| caps[1].to_string())
}
