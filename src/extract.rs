//! Text extraction: embedded PDF text with a per-page OCR fallback.
//!
//! PDFs are read through their embedded text layer first. Pages whose
//! embedded text scores below the configured quality threshold (scanned
//! pages, broken encodings) are re-read through the OCR engine, and the
//! better-scoring variant wins. Plain images always go through OCR.

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::models::{PageSource, PageText};
use crate::quality::quality_score;

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "bmp"];

#[derive(Debug)]
pub enum ExtractError {
    Pdf(String),
    Ocr(String),
    UnsupportedFormat(String),
    Io(String),
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::Pdf(msg) => write!(f, "PDF extraction failed: {}", msg),
            ExtractError::Ocr(msg) => write!(f, "OCR failed: {}", msg),
            ExtractError::UnsupportedFormat(ext) => write!(f, "unsupported file format: {}", ext),
            ExtractError::Io(msg) => write!(f, "I/O error during extraction: {}", msg),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Optical character recognition over a file or a single PDF page.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognize text in an image file.
    async fn recognize_image(&self, image: &Path) -> Result<String, ExtractError>;

    /// Recognize text on one page of a PDF (1-based page number).
    async fn recognize_pdf_page(&self, pdf: &Path, page_no: usize) -> Result<String, ExtractError>;
}

/// OCR via the `tesseract` CLI; PDF pages are rasterized with `pdftoppm`
/// first. Both tools must be on PATH.
pub struct TesseractOcr {
    languages: String,
}

impl TesseractOcr {
    pub fn new(languages: impl Into<String>) -> Self {
        Self {
            languages: languages.into(),
        }
    }

    async fn run_tesseract(&self, image: &Path) -> Result<String, ExtractError> {
        let output = tokio::process::Command::new("tesseract")
            .arg(image)
            .arg("stdout")
            .arg("-l")
            .arg(&self.languages)
            .output()
            .await
            .map_err(|e| ExtractError::Ocr(format!("failed to spawn tesseract: {}", e)))?;
        if !output.status.success() {
            return Err(ExtractError::Ocr(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self::new("ces+eng")
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn recognize_image(&self, image: &Path) -> Result<String, ExtractError> {
        self.run_tesseract(image).await
    }

    async fn recognize_pdf_page(&self, pdf: &Path, page_no: usize) -> Result<String, ExtractError> {
        let tmp = tempfile::tempdir().map_err(|e| ExtractError::Io(e.to_string()))?;
        let prefix = tmp.path().join("page");
        let status = tokio::process::Command::new("pdftoppm")
            .arg("-png")
            .arg("-r")
            .arg("300")
            .arg("-f")
            .arg(page_no.to_string())
            .arg("-l")
            .arg(page_no.to_string())
            .arg(pdf)
            .arg(&prefix)
            .status()
            .await
            .map_err(|e| ExtractError::Ocr(format!("failed to spawn pdftoppm: {}", e)))?;
        if !status.success() {
            return Err(ExtractError::Ocr(format!("pdftoppm exited with {}", status)));
        }

        // pdftoppm pads the page number; take whatever single file it wrote.
        let rendered = std::fs::read_dir(tmp.path())
            .map_err(|e| ExtractError::Io(e.to_string()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .next()
            .ok_or_else(|| ExtractError::Ocr("pdftoppm produced no output".to_string()))?;
        self.run_tesseract(&rendered).await
    }
}

/// Turns a file into per-page text with provenance and quality scores.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<Vec<PageText>, ExtractError>;
}

/// Default extractor: embedded PDF text, OCR fallback per page, OCR for
/// plain images.
pub struct DocumentExtractor {
    ocr: Arc<dyn OcrEngine>,
    page_quality_threshold: f64,
}

impl DocumentExtractor {
    pub fn new(ocr: Arc<dyn OcrEngine>, page_quality_threshold: f64) -> Self {
        Self {
            ocr,
            page_quality_threshold,
        }
    }

    async fn extract_pdf(&self, path: &Path) -> Result<Vec<PageText>, ExtractError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ExtractError::Io(e.to_string()))?;
        let embedded = tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text_from_mem_by_pages(&bytes)
        })
        .await
        .map_err(|e| ExtractError::Pdf(e.to_string()))?
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;

        let mut pages = Vec::with_capacity(embedded.len());
        for (idx, text) in embedded.into_iter().enumerate() {
            let page_no = idx + 1;
            let embedded_quality = quality_score(&text);
            if embedded_quality >= self.page_quality_threshold {
                pages.push(PageText {
                    page_no,
                    text,
                    source: PageSource::Embedded,
                    quality: embedded_quality,
                });
                continue;
            }

            // Low-fidelity embedded layer; try OCR and keep whichever
            // variant scores higher. An OCR failure falls back to the
            // embedded text rather than failing the whole file.
            match self.ocr.recognize_pdf_page(path, page_no).await {
                Ok(ocr_text) => {
                    let ocr_quality = quality_score(&ocr_text);
                    if ocr_quality > embedded_quality {
                        pages.push(PageText {
                            page_no,
                            text: ocr_text,
                            source: PageSource::Ocr,
                            quality: ocr_quality,
                        });
                    } else {
                        pages.push(PageText {
                            page_no,
                            text,
                            source: PageSource::Embedded,
                            quality: embedded_quality,
                        });
                    }
                }
                Err(err) => {
                    tracing::warn!(page = page_no, error = %err, "page OCR failed, keeping embedded text");
                    pages.push(PageText {
                        page_no,
                        text,
                        source: PageSource::Embedded,
                        quality: embedded_quality,
                    });
                }
            }
        }
        Ok(pages)
    }

    async fn extract_image(&self, path: &Path) -> Result<Vec<PageText>, ExtractError> {
        let text = self.ocr.recognize_image(path).await?;
        let quality = quality_score(&text);
        Ok(vec![PageText {
            page_no: 1,
            text,
            source: PageSource::Ocr,
            quality,
        }])
    }
}

#[async_trait]
impl TextExtractor for DocumentExtractor {
    async fn extract(&self, path: &Path) -> Result<Vec<PageText>, ExtractError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if ext == "pdf" {
            self.extract_pdf(path).await
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            self.extract_image(path).await
        } else {
            Err(ExtractError::UnsupportedFormat(ext))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeOcr {
        text: String,
    }

    #[async_trait]
    impl OcrEngine for FakeOcr {
        async fn recognize_image(&self, _image: &Path) -> Result<String, ExtractError> {
            Ok(self.text.clone())
        }
        async fn recognize_pdf_page(
            &self,
            _pdf: &Path,
            _page_no: usize,
        ) -> Result<String, ExtractError> {
            Ok(self.text.clone())
        }
    }

    #[tokio::test]
    async fn images_are_routed_through_ocr() {
        let ocr = Arc::new(FakeOcr {
            text: "ÚČTENKA\nRohlík 2 x 5,60 11,20\nCelkem 11,20".to_string(),
        });
        let extractor = DocumentExtractor::new(ocr, 0.35);
        let tmp = tempfile::TempDir::new().unwrap();
        let img = tmp.path().join("receipt.jpg");
        std::fs::write(&img, b"not really a jpeg").unwrap();

        let pages = extractor.extract(&img).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].source, PageSource::Ocr);
        assert!(pages[0].text.contains("ÚČTENKA"));
    }

    #[tokio::test]
    async fn unknown_extension_is_rejected() {
        let ocr = Arc::new(FakeOcr {
            text: String::new(),
        });
        let extractor = DocumentExtractor::new(ocr, 0.35);
        let err = extractor.extract(Path::new("/tmp/notes.txt")).await.unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn invalid_pdf_reports_pdf_error() {
        let ocr = Arc::new(FakeOcr {
            text: String::new(),
        });
        let extractor = DocumentExtractor::new(ocr, 0.35);
        let tmp = tempfile::TempDir::new().unwrap();
        let pdf = tmp.path().join("broken.pdf");
        std::fs::write(&pdf, b"not a pdf").unwrap();
        let err = extractor.extract(&pdf).await.unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }
}
