//! Icon resolution: key spec to key-sized raster.
//!
//! `mdi:<name>` icons are downloaded from the configured SVG repository and get
//! their root `fill` forced to the key's color; anything else is treated as
//! inline SVG markup. Rendering happens at an oversampled resolution on the
//! blocking pool, then the result is downscaled to the exact key size.

use std::time::Duration;

use async_trait::async_trait;
use image::{imageops, imageops::FilterType, DynamicImage, Rgba, RgbaImage};
use resvg::{tiny_skia, usvg};
use thiserror::Error;
use tracing::debug;

use super::schema::KeySpec;
use crate::config::bridge::BridgeConfig;

#[derive(Debug, Error)]
pub enum IconError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },

    #[error("failed to fetch {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("malformed SVG: {0}")]
    Markup(String),

    #[error("rendering failed: {0}")]
    Render(String),

    #[error("render task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Produces the icon for a key, sized `width` x `height`, with straight alpha.
#[async_trait]
pub trait IconSource: Send + Sync {
    async fn render(&self, spec: &KeySpec, width: u32, height: u32)
        -> Result<RgbaImage, IconError>;
}

/// HTTP + resvg backed `IconSource`.
pub struct IconResolver {
    client: reqwest::Client,
    config: BridgeConfig,
}

impl IconResolver {
    pub fn new(config: &BridgeConfig) -> Result<Self, IconError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.icon_fetch_timeout_secs))
            .build()
            .map_err(|e| IconError::Transport {
                url: config.icon_url_template.clone(),
                source: e,
            })?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    async fn fetch(&self, name: &str) -> Result<Vec<u8>, IconError> {
        let url = self.config.icon_url(name);
        debug!("Fetching icon {}", url);

        let classify = |e: reqwest::Error, url: &str| {
            if e.is_timeout() {
                IconError::Timeout { url: url.to_string() }
            } else {
                IconError::Transport {
                    url: url.to_string(),
                    source: e,
                }
            }
        };

        let response = self.client.get(&url).send().await.map_err(|e| classify(e, &url))?;

        if !response.status().is_success() {
            return Err(IconError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| classify(e, &url))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl IconSource for IconResolver {
    async fn render(
        &self,
        spec: &KeySpec,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, IconError> {
        let svg = match spec.mdi_name() {
            Some(name) => {
                let raw = self.fetch(name).await?;
                let markup = String::from_utf8(raw)
                    .map_err(|e| IconError::Markup(format!("not UTF-8: {e}")))?;
                let color = spec.color.as_deref().unwrap_or(&self.config.default_icon_color);
                set_root_fill(&markup, color)?.into_bytes()
            }
            None => spec.icon.clone().into_bytes(),
        };

        let oversample = self.config.oversample.max(1);
        tokio::task::spawn_blocking(move || rasterize(&svg, width, height, oversample)).await?
    }
}

/// Sets (or replaces) the `fill` attribute of the root `<svg>` element.
///
/// Only the root start tag is touched; fills on child elements are kept.
pub fn set_root_fill(svg: &str, color: &str) -> Result<String, IconError> {
    let start = find_root_tag(svg).ok_or_else(|| IconError::Markup("no <svg> element".into()))?;
    let attrs_start = start + "<svg".len();
    let bytes = svg.as_bytes();
    let value = format!("\"{}\"", escape_attr(color));

    let mut i = attrs_start;
    let mut fill_span = None;

    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        match bytes.get(i) {
            None => return Err(IconError::Markup("unterminated <svg> tag".into())),
            Some(b'>') | Some(b'/') => break,
            Some(_) => {}
        }

        let name_start = i;
        while i < bytes.len() && !matches!(bytes[i], b'=' | b'>' | b'/') && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i == name_start {
            i += 1;
            continue;
        }
        let name = &svg[name_start..i];

        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if bytes.get(i) != Some(&b'=') {
            continue;
        }
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let value_start = i;
        match bytes.get(i) {
            Some(&quote @ (b'"' | b'\'')) => {
                let close = svg[i + 1..]
                    .find(quote as char)
                    .ok_or_else(|| IconError::Markup(format!("unterminated value for '{name}'")))?;
                i += close + 2;
            }
            Some(_) => {
                while i < bytes.len() && bytes[i] != b'>' && !bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
            }
            None => return Err(IconError::Markup("unterminated <svg> tag".into())),
        }

        if name == "fill" {
            fill_span = Some((value_start, i));
        }
    }

    let mut out = String::with_capacity(svg.len() + value.len() + 8);
    match fill_span {
        Some((from, to)) => {
            out.push_str(&svg[..from]);
            out.push_str(&value);
            out.push_str(&svg[to..]);
        }
        None => {
            out.push_str(&svg[..attrs_start]);
            out.push_str(" fill=");
            out.push_str(&value);
            out.push_str(&svg[attrs_start..]);
        }
    }
    Ok(out)
}

/// Offset of the root `<svg` start tag, past any XML declaration, processing
/// instructions, comments and DOCTYPE. `None` if the first element is not `<svg>`.
fn find_root_tag(svg: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(rel) = svg[from..].find('<') {
        let idx = from + rel;
        let tail = &svg[idx..];

        from = if let Some(comment) = tail.strip_prefix("<!--") {
            idx + 4 + comment.find("-->")? + 3
        } else if tail.starts_with("<?") {
            idx + tail.find("?>")? + 2
        } else if tail.starts_with("<!") {
            idx + declaration_len(tail)?
        } else if tail.starts_with("<svg")
            && tail
                .as_bytes()
                .get(4)
                .is_some_and(|b| b.is_ascii_whitespace() || *b == b'>' || *b == b'/')
        {
            return Some(idx);
        } else {
            return None;
        };
    }
    None
}

/// Length of a `<!...>` declaration, including an internal `[...]` subset.
fn declaration_len(tail: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote = None;
    for (i, b) in tail.bytes().enumerate().skip(2) {
        match (quote, b) {
            (Some(q), _) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'\'') => quote = Some(b),
            (None, b'[') => depth += 1,
            (None, b']') => depth = depth.saturating_sub(1),
            (None, b'>') if depth == 0 => return Some(i + 1),
            _ => {}
        }
    }
    None
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

/// Renders `svg` at `oversample` times the target size, aspect preserved and
/// centred, then downsamples to exactly `width` x `height`.
pub fn rasterize(svg: &[u8], width: u32, height: u32, oversample: u32) -> Result<RgbaImage, IconError> {
    if width == 0 || height == 0 {
        return Err(IconError::Render(format!("invalid key size {width}x{height}")));
    }

    let tree = usvg::Tree::from_data(svg, &usvg::Options::default())
        .map_err(|e| IconError::Markup(e.to_string()))?;

    let canvas_w = width * oversample;
    let canvas_h = height * oversample;
    let mut pixmap = tiny_skia::Pixmap::new(canvas_w, canvas_h)
        .ok_or_else(|| IconError::Render(format!("cannot allocate {canvas_w}x{canvas_h} canvas")))?;

    let size = tree.size();
    let scale = (canvas_w as f32 / size.width()).min(canvas_h as f32 / size.height());
    let dx = (canvas_w as f32 - size.width() * scale) / 2.0;
    let dy = (canvas_h as f32 - size.height() * scale) / 2.0;
    let transform = tiny_skia::Transform::from_row(scale, 0.0, 0.0, scale, dx, dy);

    resvg::render(&tree, transform, &mut pixmap.as_mut());

    let mut full = RgbaImage::new(canvas_w, canvas_h);
    for (dst, src) in full.pixels_mut().zip(pixmap.pixels()) {
        let c = src.demultiply();
        *dst = Rgba([c.red(), c.green(), c.blue(), c.alpha()]);
    }

    if oversample == 1 {
        return Ok(full);
    }
    Ok(imageops::resize(&full, width, height, FilterType::Lanczos3))
}

/// Composites `icon` over an opaque black key image of the same size.
pub fn compose_key_image(icon: &RgbaImage) -> DynamicImage {
    let mut key = RgbaImage::from_pixel(icon.width(), icon.height(), Rgba([0, 0, 0, 255]));
    imageops::overlay(&mut key, icon, 0, 0);
    DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(key).to_rgb8())
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    const RED_SQUARE: &str = r#"<svg xmlns="http://www.w3.org/2000/svg" width="10" height="10"><rect width="10" height="10" fill="red"/></svg>"#;

    #[test]
    fn test_fill_inserted() {
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 24 24"><path d="M0 0"/></svg>"#;
        let out = set_root_fill(svg, "blue").unwrap();
        assert_eq!(
            out,
            r#"<svg fill="blue" xmlns="http://www.w3.org/2000/svg" viewBox="0 0 24 24"><path d="M0 0"/></svg>"#
        );
    }

    #[test]
    fn test_fill_replaced() {
        let svg = r#"<svg fill='black' data-fill="x" viewBox="0 0 24 24"><path fill="green"/></svg>"#;
        let out = set_root_fill(svg, "#ff0000").unwrap();
        assert_eq!(
            out,
            r##"<svg fill="#ff0000" data-fill="x" viewBox="0 0 24 24"><path fill="green"/></svg>"##
        );
    }

    #[test]
    fn test_fill_skips_prolog_and_quoted_gt() {
        let svg = "<?xml version=\"1.0\"?>\n<!-- <svgfoo> -->\n<svg title=\"a > b\"\n  fill=none><g/></svg>";
        let out = set_root_fill(svg, "red").unwrap();
        assert!(out.contains("<svg title=\"a > b\"\n  fill=\"red\"><g/>"));
    }

    #[test]
    fn test_fill_ignores_svg_inside_comment_and_doctype() {
        let svg = concat!(
            "<?xml version=\"1.0\"?>\n",
            "<!-- <svg fill=\"x\"> -->\n",
            "<!DOCTYPE svg PUBLIC \"-//W3C//DTD SVG 1.1//EN\" \"svg11.dtd\" [\n",
            "  <!ENTITY icon \"<svg fill='y'>\">\n",
            "]>\n",
            "<svg viewBox=\"0 0 24 24\"><path/></svg>",
        );
        let out = set_root_fill(svg, "red").unwrap();

        assert!(out.contains("<!-- <svg fill=\"x\"> -->"));
        assert!(out.contains("<!ENTITY icon \"<svg fill='y'>\">"));
        assert!(out.ends_with("<svg fill=\"red\" viewBox=\"0 0 24 24\"><path/></svg>"));
    }

    #[test]
    fn test_fill_escapes_color() {
        let out = set_root_fill("<svg/>", "a\"b").unwrap();
        assert_eq!(out, "<svg fill=\"a&quot;b\"/>");
    }

    #[test]
    fn test_fill_without_svg() {
        assert!(matches!(
            set_root_fill("<html></html>", "red"),
            Err(IconError::Markup(_))
        ));
        assert!(matches!(
            set_root_fill("<svg width=\"1", "red"),
            Err(IconError::Markup(_))
        ));
        assert!(matches!(
            set_root_fill("<!-- <svg fill=\"x\"> unterminated", "red"),
            Err(IconError::Markup(_))
        ));
    }

    #[test]
    fn test_rasterize_exact_size() {
        let icon = rasterize(RED_SQUARE.as_bytes(), 72, 72, 2).unwrap();
        assert_eq!(icon.dimensions(), (72, 72));
        let center = icon.get_pixel(36, 36);
        assert!(center[0] > 200 && center[1] < 50 && center[3] > 200);
    }

    #[test]
    fn test_rasterize_preserves_aspect() {
        let wide = r#"<svg xmlns="http://www.w3.org/2000/svg" width="20" height="10"><rect width="20" height="10" fill="white"/></svg>"#;
        let key = compose_key_image(&rasterize(wide.as_bytes(), 80, 80, 2).unwrap()).to_rgb8();

        assert_eq!(key.get_pixel(40, 2).0, [0, 0, 0]);
        assert!(key.get_pixel(40, 40)[0] > 240);
    }

    #[test]
    fn test_rasterize_malformed() {
        assert!(matches!(
            rasterize(b"<svg", 72, 72, 2),
            Err(IconError::Markup(_))
        ));
        assert!(matches!(
            rasterize(RED_SQUARE.as_bytes(), 0, 72, 2),
            Err(IconError::Render(_))
        ));
    }

    #[test]
    fn test_compose_transparent_is_black() {
        let icon = RgbaImage::new(4, 4);
        let key = compose_key_image(&icon).to_rgb8();
        assert!(key.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    /// Serves one canned HTTP response per connection.
    async fn serve(response: &'static str, delay: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                tokio::time::sleep(delay).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/{{}}.svg")
    }

    fn resolver(url_template: String, timeout_secs: u64) -> IconResolver {
        IconResolver::new(&BridgeConfig {
            icon_url_template: url_template,
            icon_fetch_timeout_secs: timeout_secs,
            ..Default::default()
        })
        .unwrap()
    }

    fn mdi(name: &str, color: Option<&str>) -> KeySpec {
        KeySpec {
            kind: "button".into(),
            icon: format!("mdi:{name}"),
            color: color.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_fetch_and_color() {
        let body = r#"<svg xmlns="http://www.w3.org/2000/svg" width="8" height="8"><rect width="8" height="8"/></svg>"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/svg+xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let resolver = resolver(serve(response, Duration::ZERO).await, 5);

        let icon = resolver.render(&mdi("square", Some("lime")), 16, 16).await.unwrap();
        let px = icon.get_pixel(8, 8);
        assert!(px[1] > 200 && px[0] < 50, "expected lime, got {:?}", px);

        let icon = resolver.render(&mdi("square", None), 16, 16).await.unwrap();
        let px = icon.get_pixel(8, 8);
        assert!(px[2] > 200 && px[0] < 50, "expected default blue, got {:?}", px);
    }

    #[tokio::test]
    async fn test_fetch_http_error() {
        let url = serve(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            Duration::ZERO,
        )
        .await;
        let err = resolver(url, 5).render(&mdi("nope", None), 16, 16).await.unwrap_err();
        assert!(matches!(err, IconError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let url = serve(
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            Duration::from_secs(5),
        )
        .await;
        let err = resolver(url, 1).render(&mdi("slow", None), 16, 16).await.unwrap_err();
        assert!(matches!(err, IconError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_inline_svg_ignores_color() {
        let resolver = resolver("http://127.0.0.1:9/{}.svg".into(), 1);
        let spec = KeySpec {
            kind: "button".into(),
            icon: RED_SQUARE.into(),
            color: Some("blue".into()),
        };
        let icon = resolver.render(&spec, 24, 24).await.unwrap();
        assert!(icon.get_pixel(12, 12)[0] > 200);
    }
}
