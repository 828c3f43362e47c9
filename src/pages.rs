//! Rendered page images of the current document and the list operations
//! on them.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbaImage};
use pdfium_render::prelude::{PdfRenderConfig, Pdfium, PdfiumError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::gemini::Part;

/// Pages sent to the model per analysis request.
pub const ANALYSIS_GROUP_SIZE: usize = 5;
pub const DEFAULT_PAGES_PER_VIEW: usize = 10;
/// Zoom applied to PDF pages before they are encoded.
pub const PDF_RENDER_SCALE: f32 = 2.5;
const JPEG_QUALITY: u8 = 100;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum PageError {
    #[error("not a base64 image data URL")]
    InvalidDataUrl,
    #[error("page {0} does not exist")]
    PageOutOfRange(usize),
    #[error("no pages selected")]
    NothingSelected,
    #[error("merging documents is not supported yet")]
    MergeUnsupported,
    #[error("no page images found in {}", .0.display())]
    NoPages(PathBuf),
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
    #[error("PDF rendering failed: {0}")]
    Pdf(#[from] PdfiumError),
    #[error("failed to encode page {page}: {reason}")]
    Encode { page: usize, reason: String },
}

/// One rendered page, held as a `data:<mime>;base64,<payload>` URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PageImage {
    data_url: String,
    payload_start: usize,
}

impl PageImage {
    pub fn from_bytes(mime_type: &str, bytes: &[u8]) -> Self {
        let prefix = format!("data:{mime_type};base64,");
        let payload_start = prefix.len();
        Self {
            data_url: prefix + &BASE64_STANDARD.encode(bytes),
            payload_start,
        }
    }

    pub fn parse(data_url: &str) -> Result<Self, PageError> {
        let rest = data_url.strip_prefix("data:").ok_or(PageError::InvalidDataUrl)?;
        let (mime_type, payload) = rest.split_once(";base64,").ok_or(PageError::InvalidDataUrl)?;
        if !mime_type.starts_with("image/") {
            return Err(PageError::InvalidDataUrl);
        }
        BASE64_STANDARD
            .decode(payload)
            .map_err(|_| PageError::InvalidDataUrl)?;
        Ok(Self {
            data_url: data_url.to_string(),
            payload_start: data_url.len() - payload.len(),
        })
    }

    pub fn as_data_url(&self) -> &str {
        &self.data_url
    }

    pub fn mime_type(&self) -> &str {
        let header = &self.data_url["data:".len()..self.payload_start];
        header.trim_end_matches(";base64,")
    }

    pub fn base64_payload(&self) -> &str {
        &self.data_url[self.payload_start..]
    }

    pub fn decode(&self) -> Result<Vec<u8>, PageError> {
        BASE64_STANDARD
            .decode(self.base64_payload())
            .map_err(|_| PageError::InvalidDataUrl)
    }

    /// File extension matching the mime type, for exports.
    pub fn extension(&self) -> &'static str {
        match self.mime_type() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        }
    }

    pub fn to_part(&self) -> Part {
        Part::InlineData {
            mime_type: self.mime_type().to_string(),
            data: self.base64_payload().to_string(),
        }
    }
}

impl TryFrom<String> for PageImage {
    type Error = PageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PageImage::parse(&value)
    }
}

impl From<PageImage> for String {
    fn from(page: PageImage) -> Self {
        page.data_url
    }
}

/// Ordered pages plus a 1-based selection and current page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSet {
    pages: Vec<PageImage>,
    selected: BTreeSet<usize>,
    current: usize,
}

impl PageSet {
    pub fn new(pages: Vec<PageImage>) -> Self {
        let current = if pages.is_empty() { 0 } else { 1 };
        Self {
            pages,
            selected: BTreeSet::new(),
            current,
        }
    }

    pub fn pages(&self) -> &[PageImage] {
        &self.pages
    }

    pub fn into_pages(self) -> Vec<PageImage> {
        self.pages
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Current page number, or 0 when the set is empty.
    pub fn current_page(&self) -> usize {
        self.current
    }

    pub fn set_current_page(&mut self, number: usize) -> Result<(), PageError> {
        self.check(number)?;
        self.current = number;
        Ok(())
    }

    pub fn selected(&self) -> Vec<usize> {
        self.selected.iter().copied().collect()
    }

    /// Flips the selection of page `number`; returns whether it is now
    /// selected.
    pub fn toggle_selection(&mut self, number: usize) -> Result<bool, PageError> {
        self.check(number)?;
        if self.selected.remove(&number) {
            Ok(false)
        } else {
            self.selected.insert(number);
            Ok(true)
        }
    }

    /// Removes every selected page. Returns how many were removed.
    pub fn delete_selected(&mut self) -> Result<usize, PageError> {
        if self.selected.is_empty() {
            return Err(PageError::NothingSelected);
        }
        let selected = std::mem::take(&mut self.selected);
        let before = self.pages.len();
        let mut number = 0;
        self.pages.retain(|_| {
            number += 1;
            !selected.contains(&number)
        });
        self.clamp_current();
        Ok(before - self.pages.len())
    }

    /// Removes one page. Selected page numbers after it shift down by one.
    pub fn delete_page(&mut self, number: usize) -> Result<PageImage, PageError> {
        self.check(number)?;
        let removed = self.pages.remove(number - 1);
        self.selected = self
            .selected
            .iter()
            .filter(|&&selected| selected != number)
            .map(|&selected| if selected > number { selected - 1 } else { selected })
            .collect();
        self.clamp_current();
        Ok(removed)
    }

    /// Keeps only the selected pages, in their original order.
    pub fn split(&mut self) -> Result<usize, PageError> {
        if self.selected.is_empty() {
            return Err(PageError::NothingSelected);
        }
        let selected = std::mem::take(&mut self.selected);
        let mut number = 0;
        self.pages.retain(|_| {
            number += 1;
            selected.contains(&number)
        });
        self.current = if self.pages.is_empty() { 0 } else { 1 };
        Ok(self.pages.len())
    }

    pub fn merge(&mut self, _other: PageSet) -> Result<(), PageError> {
        Err(PageError::MergeUnsupported)
    }

    /// Pages on view `view` (1-based) when showing `per_page` at a time.
    pub fn page(&self, view: usize, per_page: usize) -> &[PageImage] {
        if view == 0 || per_page == 0 {
            return &[];
        }
        let start = (view - 1).saturating_mul(per_page);
        if start >= self.pages.len() {
            return &[];
        }
        let end = (start + per_page).min(self.pages.len());
        &self.pages[start..end]
    }

    pub fn view_count(&self, per_page: usize) -> usize {
        if per_page == 0 {
            return 0;
        }
        self.pages.len().div_ceil(per_page)
    }

    /// Consecutive groups of at most `size` pages with the 1-based number
    /// of each group's first page.
    pub fn groups(&self, size: usize) -> impl Iterator<Item = (usize, &[PageImage])> {
        self.pages
            .chunks(size.max(1))
            .enumerate()
            .map(move |(idx, chunk)| (idx * size.max(1) + 1, chunk))
    }

    fn check(&self, number: usize) -> Result<(), PageError> {
        if number == 0 || number > self.pages.len() {
            return Err(PageError::PageOutOfRange(number));
        }
        Ok(())
    }

    fn clamp_current(&mut self) {
        self.current = self.current.clamp(1, self.pages.len().max(1));
        if self.pages.is_empty() {
            self.current = 0;
        }
    }
}

/// Produces page images for a document.
pub trait PageRenderer {
    fn page_count(&self) -> usize;
    fn render_page(&self, index: usize) -> Result<PageImage, PageError>;
}

/// Uses a directory of pre-rendered page images (png/jpg/jpeg), one file
/// per page, in file-name order.
#[derive(Debug, Clone)]
pub struct ImageDirRenderer {
    files: Vec<PathBuf>,
}

impl ImageDirRenderer {
    pub fn open(dir: &Path) -> Result<Self, PageError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).max_depth(1).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            if mime_for(entry.path()).is_some() {
                files.push(entry.into_path());
            }
        }
        if files.is_empty() {
            return Err(PageError::NoPages(dir.to_path_buf()));
        }
        Ok(Self { files })
    }
}

impl PageRenderer for ImageDirRenderer {
    fn page_count(&self) -> usize {
        self.files.len()
    }

    fn render_page(&self, index: usize) -> Result<PageImage, PageError> {
        let path = self
            .files
            .get(index)
            .ok_or(PageError::PageOutOfRange(index + 1))?;
        let bytes = std::fs::read(path).map_err(|source| PageError::Io {
            path: path.clone(),
            source,
        })?;
        let mime = mime_for(path).unwrap_or("image/png");
        Ok(PageImage::from_bytes(mime, &bytes))
    }
}

/// Rasterizes the pages of a PDF with pdfium and encodes each one as a
/// full-quality JPEG.
///
/// The pdfium library is looked up in `PDFIUM_DYNAMIC_LIB_PATH`, then the
/// working directory, then the system library path.
pub struct PdfRenderer {
    pdfium: Pdfium,
    bytes: Vec<u8>,
    page_count: usize,
}

impl PdfRenderer {
    pub fn open(path: &Path) -> Result<Self, PageError> {
        let bytes = std::fs::read(path).map_err(|source| PageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, PageError> {
        let pdfium = bind_pdfium()?;
        let page_count = pdfium
            .load_pdf_from_byte_slice(&bytes, None)?
            .pages()
            .len() as usize;
        if page_count == 0 {
            return Err(PageError::NoPages(PathBuf::from("PDF document")));
        }
        Ok(Self {
            pdfium,
            bytes,
            page_count,
        })
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl PageRenderer for PdfRenderer {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn render_page(&self, index: usize) -> Result<PageImage, PageError> {
        let document = self.pdfium.load_pdf_from_byte_slice(&self.bytes, None)?;
        let page = document
            .pages()
            .iter()
            .nth(index)
            .ok_or(PageError::PageOutOfRange(index + 1))?;
        let bitmap = page.render_with_config(
            &PdfRenderConfig::new().scale_page_by_factor(PDF_RENDER_SCALE),
        )?;

        let encode_err = |reason: String| PageError::Encode {
            page: index + 1,
            reason,
        };
        let width = u32::try_from(bitmap.width()).map_err(|err| encode_err(err.to_string()))?;
        let height = u32::try_from(bitmap.height()).map_err(|err| encode_err(err.to_string()))?;
        let rgba = RgbaImage::from_raw(width, height, bitmap.as_rgba_bytes())
            .ok_or_else(|| encode_err(format!("bitmap does not match {width}x{height}")))?;
        let rgb = DynamicImage::ImageRgba8(rgba).to_rgb8();

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
            .encode_image(&rgb)
            .map_err(|err| encode_err(err.to_string()))?;
        Ok(PageImage::from_bytes("image/jpeg", &jpeg))
    }
}

fn bind_pdfium() -> Result<Pdfium, PageError> {
    let dir = std::env::var_os("PDFIUM_DYNAMIC_LIB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./"));
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&dir))
        .or_else(|_| Pdfium::bind_to_system_library())?;
    Ok(Pdfium::new(bindings))
}

/// Whether `path` names a PDF file rather than a directory of page images.
pub fn is_pdf(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

fn mime_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    Some(if ext == "png" { "image/png" } else { "image/jpeg" })
}

/// A freshly imported document: the source bytes (when there is a source
/// file) and its rendered pages.
#[derive(Debug, Clone)]
pub struct ImportedDocument {
    pub file: Option<Vec<u8>>,
    pub pages: Vec<PageImage>,
}

/// Reads `source` and renders every page, reporting progress in percent:
/// 0 to 50 while reading, 50 to 100 across pages.
pub fn import_document<R: PageRenderer>(
    source: Option<&Path>,
    renderer: &R,
    progress: &mut dyn FnMut(u8),
) -> Result<ImportedDocument, PageError> {
    progress(0);
    let file = match source {
        Some(path) => Some(read_with_progress(path, progress)?),
        None => None,
    };
    progress(50);

    let total = renderer.page_count();
    let mut pages = Vec::with_capacity(total);
    for index in 0..total {
        pages.push(renderer.render_page(index)?);
        progress(50 + ((index + 1) * 50 / total.max(1)) as u8);
    }
    tracing::info!(pages = pages.len(), "imported document");
    Ok(ImportedDocument { file, pages })
}

fn read_with_progress(path: &Path, progress: &mut dyn FnMut(u8)) -> Result<Vec<u8>, PageError> {
    let io_err = |source| PageError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let total = file.metadata().map_err(io_err)?.len().max(1) as usize;
    let mut bytes = Vec::with_capacity(total);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = file.read(&mut chunk).map_err(io_err)?;
        if read == 0 {
            break;
        }
        bytes.extend_from_slice(&chunk[..read]);
        progress((bytes.len().min(total) * 50 / total) as u8);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pages(n: u8) -> PageSet {
        PageSet::new((1..=n).map(|i| PageImage::from_bytes("image/png", &[i])).collect())
    }

    fn first_bytes(set: &PageSet) -> Vec<u8> {
        set.pages().iter().map(|page| page.decode().unwrap()[0]).collect()
    }

    #[test]
    fn data_url_round_trip_parts() {
        let page = PageImage::from_bytes("image/jpeg", b"abc");
        assert_eq!(page.as_data_url(), "data:image/jpeg;base64,YWJj");
        assert_eq!(page.mime_type(), "image/jpeg");
        assert_eq!(page.base64_payload(), "YWJj");
        assert_eq!(page.extension(), "jpg");
        assert_eq!(PageImage::parse(page.as_data_url()).unwrap(), page);
    }

    #[test]
    fn rejects_non_image_urls() {
        assert!(PageImage::parse("data:text/plain;base64,YWJj").is_err());
        assert!(PageImage::parse("http://example.com/a.png").is_err());
        assert!(PageImage::parse("data:image/png;base64,***").is_err());
    }

    #[test]
    fn toggle_and_delete_selected() {
        let mut set = pages(5);
        assert!(set.toggle_selection(2).unwrap());
        assert!(set.toggle_selection(4).unwrap());
        assert!(!set.toggle_selection(4).unwrap());
        set.toggle_selection(5).unwrap();
        assert_eq!(set.delete_selected().unwrap(), 2);
        assert_eq!(first_bytes(&set), vec![1, 3, 4]);
        assert!(set.selected().is_empty());
        assert!(matches!(set.delete_selected(), Err(PageError::NothingSelected)));
    }

    #[test]
    fn delete_page_shifts_selection_and_clamps_current() {
        let mut set = pages(4);
        set.toggle_selection(2).unwrap();
        set.toggle_selection(4).unwrap();
        set.set_current_page(4).unwrap();
        set.delete_page(2).unwrap();
        assert_eq!(set.selected(), vec![3]);
        assert_eq!(set.current_page(), 3);
        assert!(matches!(set.delete_page(9), Err(PageError::PageOutOfRange(9))));
    }

    #[test]
    fn split_keeps_selected_pages() {
        let mut set = pages(5);
        assert!(matches!(set.split(), Err(PageError::NothingSelected)));
        set.toggle_selection(4).unwrap();
        set.toggle_selection(1).unwrap();
        assert_eq!(set.split().unwrap(), 2);
        assert_eq!(first_bytes(&set), vec![1, 4]);
        assert_eq!(set.current_page(), 1);
    }

    #[test]
    fn merge_is_unsupported() {
        let mut set = pages(1);
        assert!(matches!(set.merge(pages(2)), Err(PageError::MergeUnsupported)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn pagination_and_groups() {
        let set = pages(12);
        assert_eq!(set.view_count(5), 3);
        assert_eq!(set.page(3, 5).len(), 2);
        assert!(set.page(4, 5).is_empty());
        assert!(set.page(0, 5).is_empty());
        let starts: Vec<(usize, usize)> = set
            .groups(ANALYSIS_GROUP_SIZE)
            .map(|(start, chunk)| (start, chunk.len()))
            .collect();
        assert_eq!(starts, vec![(1, 5), (6, 5), (11, 2)]);
    }

    #[test]
    fn import_from_image_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("page-02.jpg"), [2u8]).unwrap();
        std::fs::write(dir.path().join("page-01.png"), [1u8]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip").unwrap();
        let source = dir.path().join("doc.pdf");
        std::fs::write(&source, b"%PDF-1.4").unwrap();

        let renderer = ImageDirRenderer::open(dir.path()).unwrap();
        let mut seen = Vec::new();
        let doc = import_document(Some(&source), &renderer, &mut |pct| seen.push(pct)).unwrap();

        assert_eq!(doc.file.as_deref(), Some(&b"%PDF-1.4"[..]));
        assert_eq!(doc.pages.len(), 2);
        assert_eq!(doc.pages[0].mime_type(), "image/png");
        assert_eq!(doc.pages[1].mime_type(), "image/jpeg");
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn empty_directory_has_no_pages() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ImageDirRenderer::open(dir.path()),
            Err(PageError::NoPages(_))
        ));
    }

    const ONE_PAGE_PDF: &[u8] = b"%PDF-1.4
1 0 obj <</Type /Catalog /Pages 2 0 R>> endobj
2 0 obj <</Type /Pages /Kids [3 0 R] /Count 1>> endobj
3 0 obj <</Type /Page /Parent 2 0 R /MediaBox [0 0 72 72]>> endobj
trailer <</Root 1 0 R>>
%%EOF
";

    #[test]
    fn pdf_renderer_rejects_non_pdf_bytes() {
        let err = PdfRenderer::from_bytes(b"plain text".to_vec())
            .err()
            .expect("plain text is not a PDF");
        assert!(matches!(err, PageError::Pdf(_)));
    }

    #[test]
    fn pdf_pages_render_as_jpeg() {
        // Needs a pdfium shared library on the loader path.
        let renderer = match PdfRenderer::from_bytes(ONE_PAGE_PDF.to_vec()) {
            Ok(renderer) => renderer,
            Err(err) => {
                eprintln!("skipping PDF rendering: {err}");
                return;
            }
        };
        assert_eq!(renderer.page_count(), 1);

        let page = renderer.render_page(0).unwrap();
        assert_eq!(page.mime_type(), "image/jpeg");
        assert_eq!(&page.decode().unwrap()[..2], &[0xFF, 0xD8]);
        assert!(matches!(
            renderer.render_page(1),
            Err(PageError::PageOutOfRange(2))
        ));
    }

    #[test]
    fn pdf_files_are_told_apart_from_directories() {
        let dir = TempDir::new().unwrap();
        let pdf = dir.path().join("Notes.PDF");
        std::fs::write(&pdf, ONE_PAGE_PDF).unwrap();
        assert!(is_pdf(&pdf));
        assert!(!is_pdf(dir.path()));
        assert!(!is_pdf(&dir.path().join("missing.pdf")));
    }
}
