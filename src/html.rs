//! Streaming HTML reference extraction built on `lol_html`.

use lol_html::errors::RewritingError;
use lol_html::{element, HtmlRewriter, OutputSink, Settings};
use thiserror::Error;

/// Raw `img[src]` and `a[href]` values found in one document, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageReferences {
    /// Image sources as written in the markup.
    pub images: Vec<String>,
    /// Hyperlink targets as written in the markup.
    pub links: Vec<String>,
}

impl PageReferences {
    /// True when the document referenced nothing.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.links.is_empty()
    }
}

/// Errors surfaced while parsing markup.
#[derive(Debug, Error)]
pub enum HtmlError {
    /// The rewriter rejected the markup.
    #[error("html rewrite error: {0}")]
    Rewrite(#[from] RewritingError),
}

/// Collects image sources and link targets from `body`.
///
/// Values are returned untouched; resolution and filtering belong to the frontier.
pub fn extract_references(body: &[u8]) -> Result<PageReferences, HtmlError> {
    let mut images = Vec::new();
    let mut links = Vec::new();

    {
        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: vec![
                    element!("img[src]", |el| {
                        if let Some(src) = el.get_attribute("src") {
                            images.push(src);
                        }
                        Ok(())
                    }),
                    element!("a[href]", |el| {
                        if let Some(href) = el.get_attribute("href") {
                            links.push(href);
                        }
                        Ok(())
                    }),
                ],
                ..Settings::default()
            },
            NoopSink,
        );

        for chunk in body.chunks(CHUNK_SIZE) {
            rewriter.write(chunk)?;
        }
        rewriter.end()?;
    }

    Ok(PageReferences { images, links })
}

const CHUNK_SIZE: usize = 16 * 1024;

struct NoopSink;

impl OutputSink for NoopSink {
    fn handle_chunk(&mut self, _chunk: &[u8]) {}
}
