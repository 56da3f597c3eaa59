//! HTTP side-channel for bulk data
//!
//! The command station serves catalogs and icon assets over plain HTTP;
//! these are ordinary request/response calls with no correlation. CS2-class
//! stations serve legacy delimited files, CS3-class stations serve JSON and
//! SVG icons.

use crate::catalog::{cs2file, json, AccessoryItem, Locomotive};
use crate::error::Result;
use log::info;
use std::time::Duration;

/// Which document family the station serves, derived from the main
/// device's article number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogSource {
    Cs2,
    Cs3,
}

impl CatalogSource {
    pub fn for_article(article: &str) -> Self {
        match article.trim() {
            "60216" | "60226" => Self::Cs3,
            _ => Self::Cs2,
        }
    }
}

/// Icon payload format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IconFormat {
    Png,
    /// CS3 serves scalable icons; rasterization is left to the caller
    Svg,
}

/// A fetched icon asset
#[derive(Debug, Clone)]
pub struct IconData {
    pub name: String,
    pub format: IconFormat,
    pub bytes: Vec<u8>,
}

/// Blocking HTTP client for one station
pub struct HttpClient {
    base_url: String,
    source: CatalogSource,
    client: reqwest::blocking::Client,
}

impl HttpClient {
    pub fn new(host: &str, port: u16, source: CatalogSource) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: format!("http://{host}:{port}"),
            source,
            client,
        })
    }

    pub fn source(&self) -> CatalogSource {
        self.source
    }

    fn get_text(&self, path: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send()?.error_for_status()?;
        Ok(response.text()?)
    }

    fn get_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send()?.error_for_status()?;
        Ok(response.bytes()?.to_vec())
    }

    /// Download and parse the locomotive catalog
    pub fn fetch_locomotives(&self) -> Result<Vec<Locomotive>> {
        let locomotives = match self.source {
            CatalogSource::Cs2 => cs2file::parse_locomotives(&self.get_text("/config/lokomotive.cs2")?),
            CatalogSource::Cs3 => json::parse_locomotives(&self.get_text("/app/api/loks")?)?,
        };
        info!("Fetched {} locomotives", locomotives.len());
        Ok(locomotives)
    }

    /// Download and parse the accessory catalog
    pub fn fetch_accessories(&self) -> Result<Vec<AccessoryItem>> {
        let accessories = match self.source {
            CatalogSource::Cs2 => cs2file::parse_accessories(&self.get_text("/config/magnetartikel.cs2")?),
            CatalogSource::Cs3 => json::parse_accessories(&self.get_text("/app/api/mags")?)?,
        };
        info!("Fetched {} accessories", accessories.len());
        Ok(accessories)
    }

    /// Download one icon asset by catalog name
    pub fn fetch_icon(&self, name: &str) -> Result<IconData> {
        let (path, format) = match self.source {
            CatalogSource::Cs2 => (format!("/icons/{name}.png"), IconFormat::Png),
            CatalogSource::Cs3 => (format!("/app/assets/lok/{name}.svg"), IconFormat::Svg),
        };
        let bytes = self.get_bytes(&path)?;
        Ok(IconData {
            name: name.to_string(),
            format,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_catalog_source_by_article() {
        assert_eq!(CatalogSource::for_article("60214"), CatalogSource::Cs2);
        assert_eq!(CatalogSource::for_article("60215"), CatalogSource::Cs2);
        assert_eq!(CatalogSource::for_article("60216"), CatalogSource::Cs3);
        assert_eq!(CatalogSource::for_article(" 60226 "), CatalogSource::Cs3);
    }

    /// One-shot HTTP server returning a fixed body for any GET
    fn serve_once(body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).unwrap();
        });
        port
    }

    #[test]
    fn test_fetch_cs2_locomotives() {
        let body = "[lokomotive]\nlok\n .uid=0x4001\n .name=BR 81 002\n .adresse=0x1\n";
        let port = serve_once(body);
        let client = HttpClient::new("127.0.0.1", port, CatalogSource::Cs2).unwrap();
        let loks = client.fetch_locomotives().unwrap();
        assert_eq!(loks.len(), 1);
        assert_eq!(loks[0].name, "BR 81 002");
    }

    #[test]
    fn test_fetch_cs3_accessories() {
        let body = r#"{"mags": [{"id": 3, "name": "Sig", "typ": "lichtsignal_HP012"}]}"#;
        let port = serve_once(body);
        let client = HttpClient::new("127.0.0.1", port, CatalogSource::Cs3).unwrap();
        let mags = client.fetch_accessories().unwrap();
        assert_eq!(mags.len(), 1);
        assert_eq!(mags[0].secondary_address, Some(4));
    }
}
