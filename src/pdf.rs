use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use itertools::Itertools;
use crate::geometry::{clamp, PageBox, PointRect};
use crate::models::DocumentField;
use crate::schema::FieldType;

const FONT_NAME: &str = "F_docseal_Helvetica";
const TEXT_INSET: f64 = 4.0;

#[derive(Debug, thiserror::Error)]
pub enum PdfError {
    #[error("unable to parse PDF: {0}")]
    Parse(lopdf::Error),
    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("unable to decode PNG: {0}")]
    Png(#[from] png::DecodingError),
    #[error("unsupported image: {0}")]
    UnsupportedImage(String),
    #[error("invalid page: {0}")]
    Page(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Document {
    inner_doc: lopdf::Document,
    font_id: Option<lopdf::ObjectId>,
    pages: BTreeMap<u32, lopdf::ObjectId>,
}

pub struct DocumentPage<'a> {
    page_id: lopdf::ObjectId,
    media_box: PageBox,
    doc: &'a mut Document,
}

pub struct InnerDocumentPage<'a> {
    media_box: PageBox,
    operations: Vec<lopdf::content::Operation>,
    xobjects: Vec<(String, lopdf::ObjectId)>,
    pub doc: &'a mut Document,
}

/// An image embedded in the document, ready to be drawn.
#[derive(Debug, Clone, Copy)]
pub struct ImageXObject {
    pub id: lopdf::ObjectId,
    pub width: u32,
    pub height: u32,
}

enum ResourcesLocation {
    Object(lopdf::ObjectId),
    Page(lopdf::ObjectId),
}

impl Document {
    pub fn load(bytes: &[u8]) -> Result<Self, PdfError> {
        let doc = lopdf::Document::load_mem(bytes).map_err(PdfError::Parse)?;
        Ok(Self::new(doc))
    }

    pub fn new(doc: lopdf::Document) -> Self {
        Self {
            pages: doc.get_pages(),
            inner_doc: doc,
            font_id: None,
        }
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    pub fn finalise(mut self) -> Result<Vec<u8>, PdfError> {
        let mut out = Vec::new();
        self.inner_doc.save_to(&mut out)?;
        Ok(out)
    }

    pub fn page(&mut self, page: u32) -> Result<DocumentPage, PdfError> {
        let page_id = match self.pages.get(&page).copied() {
            Some(i) => i,
            None => return Err(PdfError::Pdf(lopdf::Error::PageNumberNotFound(page))),
        };

        Ok(DocumentPage {
            media_box: self.get_media_box(page_id)?,
            page_id,
            doc: self,
        })
    }

    pub fn page_box(&self, page: u32) -> Result<PageBox, PdfError> {
        match self.pages.get(&page) {
            Some(id) => self.get_media_box(*id),
            None => Err(PdfError::Pdf(lopdf::Error::PageNumberNotFound(page))),
        }
    }

    pub fn png_to_xobj(&mut self, data: &[u8]) -> Result<ImageXObject, PdfError> {
        let mut img = png::Decoder::new(data);
        img.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
        let mut img_reader = img.read_info()?;
        let mut img_buf = vec![0; img_reader.output_buffer_size()];
        let img_data = img_reader.next_frame(&mut img_buf)?;
        let img_bytes = &img_buf[..img_data.buffer_size()];

        if img_data.width == 0 || img_data.height == 0 {
            return Err(PdfError::UnsupportedImage("empty image".to_string()));
        }
        if img_data.bit_depth != png::BitDepth::Eight {
            return Err(PdfError::UnsupportedImage(format!("bit depth {:?}", img_data.bit_depth)));
        }

        let (img_bytes, color_space, mask_bytes) = match img_data.color_type {
            png::ColorType::Grayscale => (img_bytes.to_vec(), "DeviceGray", None),
            png::ColorType::Rgb => (img_bytes.to_vec(), "DeviceRGB", None),
            png::ColorType::GrayscaleAlpha => {
                let mut gray_bytes = Vec::with_capacity(img_bytes.len() / 2);
                let mut alpha_bytes = Vec::with_capacity(img_bytes.len() / 2);
                for px in img_bytes.chunks_exact(2) {
                    gray_bytes.push(px[0]);
                    alpha_bytes.push(px[1]);
                }
                (gray_bytes, "DeviceGray", Some(alpha_bytes))
            }
            png::ColorType::Rgba => {
                let mut rgb_bytes = Vec::with_capacity((img_bytes.len() / 4) * 3);
                let mut alpha_bytes = Vec::with_capacity(img_bytes.len() / 4);
                for px in img_bytes.chunks_exact(4) {
                    rgb_bytes.extend_from_slice(&px[..3]);
                    alpha_bytes.push(px[3]);
                }
                (rgb_bytes, "DeviceRGB", Some(alpha_bytes))
            }
            other => return Err(PdfError::UnsupportedImage(format!("colour type {:?}", other))),
        };

        let mask_obj_id = match mask_bytes {
            Some(mask_bytes) => {
                let mask_dict = dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "ColorSpace" => "DeviceGray",
                    "Width" => lopdf::Object::Integer(img_data.width.into()),
                    "Height" => lopdf::Object::Integer(img_data.height.into()),
                    "BitsPerComponent" => lopdf::Object::Integer(8),
                    "Filter" => "FlateDecode",
                };
                let mask_obj = lopdf::Stream::new(mask_dict, zlib(&mask_bytes)?).with_compression(false);
                Some(self.inner_doc.add_object(mask_obj))
            }
            None => None,
        };

        let mut img_dict = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "ColorSpace" => color_space,
            "Width" => lopdf::Object::Integer(img_data.width.into()),
            "Height" => lopdf::Object::Integer(img_data.height.into()),
            "BitsPerComponent" => lopdf::Object::Integer(8),
            "Filter" => "FlateDecode",
        };
        if let Some(mask_obj_id) = mask_obj_id {
            img_dict.set("SMask", lopdf::Object::Reference(mask_obj_id));
        }
        let img_obj = lopdf::Stream::new(img_dict, zlib(&img_bytes)?).with_compression(false);

        Ok(ImageXObject {
            id: self.inner_doc.add_object(img_obj),
            width: img_data.width,
            height: img_data.height,
        })
    }

    fn create_or_get_font_id(&mut self) -> lopdf::ObjectId {
        match self.font_id {
            Some(f) => f,
            None => {
                let font_id = self.inner_doc.add_object(dictionary! {
                    "Type" => "Font",
                    "Subtype" => "Type1",
                    "BaseFont" => "Helvetica",
                    "Encoding" => "WinAnsiEncoding",
                });
                self.font_id = Some(font_id);
                font_id
            }
        }
    }

    fn get_inherited_attr(&self, key: &[u8], page_id: lopdf::ObjectId) -> Result<&lopdf::Object, lopdf::Error> {
        fn get_key<'a>(key: &[u8], page_node: &'a lopdf::Dictionary, doc: &'a lopdf::Document, depth: usize) -> Result<&'a lopdf::Object, lopdf::Error> {
            if let Ok(obj) = page_node.get(key) {
                Ok(obj)
            } else if depth == 0 {
                Err(lopdf::Error::ObjectNotFound)
            } else {
                let page_tree = page_node
                    .get(b"Parent")
                    .and_then(lopdf::Object::as_reference)
                    .and_then(|id| doc.get_dictionary(id))?;
                get_key(key, page_tree, doc, depth - 1)
            }
        }

        let page = self.inner_doc.get_dictionary(page_id)?;
        get_key(key, page, &self.inner_doc, 64)
    }

    fn get_media_box(&self, page_id: lopdf::ObjectId) -> Result<PageBox, PdfError> {
        let media_box = match self.get_inherited_attr(b"MediaBox", page_id)? {
            lopdf::Object::Reference(id) => self.inner_doc.get_object(*id)?,
            other => other,
        }.as_array()?;
        if media_box.len() != 4 {
            return Err(PdfError::Page(format!("Expected MediaBox to have 4 elements, actually had {}", media_box.len())));
        }

        let media_box = media_box.iter().map(obj_to_f64).collect::<Option<Vec<_>>>()
            .ok_or_else(|| PdfError::Page("Invalid MediaBox coordinate".to_string()))?;

        let page_box = PageBox::from_corners((media_box[0], media_box[1]), (media_box[2], media_box[3]));
        if !page_box.is_usable() {
            return Err(PdfError::Page("Degenerate MediaBox".to_string()));
        }
        Ok(page_box)
    }

    /// Finds the page's resource dictionary, copying inherited resources onto
    /// the page so they can be extended without touching sibling pages.
    fn resources_location(&mut self, page_id: lopdf::ObjectId) -> Result<ResourcesLocation, PdfError> {
        match self.inner_doc.get_dictionary(page_id)?.get(b"Resources") {
            Ok(lopdf::Object::Reference(id)) => return Ok(ResourcesLocation::Object(*id)),
            Ok(lopdf::Object::Dictionary(_)) => return Ok(ResourcesLocation::Page(page_id)),
            _ => {}
        }

        let inherited = match self.get_inherited_attr(b"Resources", page_id) {
            Ok(lopdf::Object::Reference(id)) => self.inner_doc.get_dictionary(*id).map(|d| d.clone()).unwrap_or_else(|_| lopdf::Dictionary::new()),
            Ok(lopdf::Object::Dictionary(d)) => d.clone(),
            _ => lopdf::Dictionary::new(),
        };
        self.inner_doc.get_object_mut(page_id)?.as_dict_mut()?.set("Resources", inherited);
        Ok(ResourcesLocation::Page(page_id))
    }

    fn resources_mut(&mut self, location: &ResourcesLocation) -> Result<&mut lopdf::Dictionary, PdfError> {
        Ok(match location {
            ResourcesLocation::Object(id) => self.inner_doc.get_object_mut(*id)?.as_dict_mut()?,
            ResourcesLocation::Page(id) => self.inner_doc.get_object_mut(*id)?.as_dict_mut()?
                .get_mut(b"Resources")?.as_dict_mut()?,
        })
    }

    fn add_resource(&mut self, location: &ResourcesLocation, category: &[u8], name: &str, target: lopdf::ObjectId) -> Result<(), PdfError> {
        let category_ref = match self.resources_mut(location)?.get(category) {
            Ok(lopdf::Object::Reference(id)) => Some(*id),
            _ => None,
        };

        let dict = match category_ref {
            Some(id) => self.inner_doc.get_object_mut(id)?.as_dict_mut()?,
            None => {
                let resources = self.resources_mut(location)?;
                if !matches!(resources.get(category), Ok(lopdf::Object::Dictionary(_))) {
                    resources.set(category.to_vec(), lopdf::Dictionary::new());
                }
                resources.get_mut(category)?.as_dict_mut()?
            }
        };
        dict.set(name, lopdf::Object::Reference(target));
        Ok(())
    }

    /// Appends `operations` to the page, isolating the existing content in
    /// its own graphics state.
    fn append_content(&mut self, page_id: lopdf::ObjectId, operations: Vec<lopdf::content::Operation>) -> Result<(), PdfError> {
        let existing = match self.inner_doc.get_dictionary(page_id)?.get(b"Contents") {
            Ok(lopdf::Object::Reference(id)) => match self.inner_doc.get_object(*id) {
                Ok(lopdf::Object::Array(arr)) => arr.clone(),
                _ => vec![lopdf::Object::Reference(*id)],
            },
            Ok(lopdf::Object::Array(arr)) => arr.clone(),
            _ => vec![],
        };

        let mut tail = b"\nQ\n".to_vec();
        tail.extend(lopdf::content::Content { operations }.encode()?);
        let open_id = self.inner_doc.add_object(lopdf::Stream::new(dictionary! {}, b"q\n".to_vec()));
        let close_id = self.inner_doc.add_object(lopdf::Stream::new(dictionary! {}, tail));

        let mut contents = Vec::with_capacity(existing.len() + 2);
        contents.push(lopdf::Object::Reference(open_id));
        contents.extend(existing);
        contents.push(lopdf::Object::Reference(close_id));

        self.inner_doc.get_object_mut(page_id)?.as_dict_mut()?.set("Contents", contents);
        Ok(())
    }
}

impl DocumentPage<'_> {
    pub fn page_box(&self) -> PageBox {
        self.media_box
    }

    pub fn setup<R, F: FnOnce(&mut InnerDocumentPage) -> R>(self, f: F) -> Result<R, PdfError> {
        let page_id = self.page_id;
        let mut inner = InnerDocumentPage {
            media_box: self.media_box,
            operations: vec![],
            xobjects: vec![],
            doc: self.doc,
        };
        let res = f(&mut inner);

        if inner.operations.is_empty() {
            return Ok(res);
        }

        let doc = inner.doc;
        let location = doc.resources_location(page_id)?;
        let font_id = doc.create_or_get_font_id();
        doc.add_resource(&location, b"Font", FONT_NAME, font_id)?;
        for (name, id) in &inner.xobjects {
            doc.add_resource(&location, b"XObject", name, *id)?;
        }
        doc.append_content(page_id, inner.operations)?;

        Ok(res)
    }
}

impl InnerDocumentPage<'_> {
    pub fn page_box(&self) -> PageBox {
        self.media_box
    }

    /// Draws a single line of text with its baseline at (`x`, `y`), cut to
    /// `max_width`. Returns whether anything was drawn.
    pub fn add_text(&mut self, text: &str, x: f64, y: f64, size: f64, max_width: f64) -> bool {
        let encoded = encode_win_ansi(text);
        let fitted = fit_text(&encoded, size, max_width);
        if fitted.is_empty() {
            return false;
        }

        self.operations.extend(vec![
            lopdf::content::Operation::new("q", vec![]),
            lopdf::content::Operation::new("rg", vec![0.into(), 0.into(), 0.into()]),
            lopdf::content::Operation::new("BT", vec![]),
            lopdf::content::Operation::new("Tf", vec![FONT_NAME.into(), size.into()]),
            lopdf::content::Operation::new("Td", vec![x.into(), y.into()]),
            lopdf::content::Operation::new("Tj", vec![lopdf::Object::string_literal(fitted.to_vec())]),
            lopdf::content::Operation::new("ET", vec![]),
            lopdf::content::Operation::new("Q", vec![]),
        ]);
        true
    }

    /// Draws a ticked box of side `size` at (`x`, `y`).
    pub fn add_checkmark_box(&mut self, x: f64, y: f64, size: f64) {
        let inset = size * 0.2;
        let line_width = clamp(size * 0.12, 0.8, 2.0);

        self.operations.extend(vec![
            lopdf::content::Operation::new("q", vec![]),
            lopdf::content::Operation::new("w", vec![1.into()]),
            lopdf::content::Operation::new("RG", vec![0.into(), 0.into(), 0.into()]),
            lopdf::content::Operation::new("rg", vec![1.into(), 1.into(), 1.into()]),
            lopdf::content::Operation::new("re", vec![x.into(), y.into(), size.into(), size.into()]),
            lopdf::content::Operation::new("B", vec![]),
            lopdf::content::Operation::new("w", vec![line_width.into()]),
            lopdf::content::Operation::new("m", vec![(x + inset).into(), (y + size * 0.5).into()]),
            lopdf::content::Operation::new("l", vec![(x + size * 0.4).into(), (y + inset).into()]),
            lopdf::content::Operation::new("S", vec![]),
            lopdf::content::Operation::new("m", vec![(x + size * 0.4).into(), (y + inset).into()]),
            lopdf::content::Operation::new("l", vec![(x + size - inset).into(), (y + size - inset).into()]),
            lopdf::content::Operation::new("S", vec![]),
            lopdf::content::Operation::new("Q", vec![]),
        ]);
    }

    pub fn add_image(&mut self, name: String, img: &ImageXObject, rect: &PointRect) {
        self.operations.extend(vec![
            lopdf::content::Operation::new("q", vec![]),
            lopdf::content::Operation::new(
                "cm",
                vec![rect.width.into(), 0.into(), 0.into(), rect.height.into(), rect.x.into(), rect.y.into()],
            ),
            lopdf::content::Operation::new("Do", vec![lopdf::Object::Name(name.clone().into_bytes())]),
            lopdf::content::Operation::new("Q", vec![]),
        ]);
        self.xobjects.push((name, img.id));
    }
}

/// A field drawn into the output, with its box in PDF points.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placement {
    pub field_id: uuid::Uuid,
    pub page_number: u32,
    pub rect: PointRect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    PageOutOfRange,
    Geometry,
    Image(String),
    Page(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Skipped {
    pub field_id: uuid::Uuid,
    pub reason: SkipReason,
}

pub struct Baked {
    pub bytes: Vec<u8>,
    pub placements: Vec<Placement>,
    pub skipped: Vec<Skipped>,
}

/// Draws field values and signature images into a copy of `base`.
///
/// Only an unreadable base document fails the bake; fields that cannot be
/// drawn are reported in [`Baked::skipped`] and the rest still render.
pub fn bake(
    base: &[u8], fields: &[DocumentField], values: &HashMap<uuid::Uuid, String>,
    images: &HashMap<uuid::Uuid, Vec<u8>>,
) -> Result<Baked, PdfError> {
    let mut pdf_doc = Document::load(base)?;
    let page_count = pdf_doc.page_count();
    let mut placements = vec![];
    let mut skipped = vec![];

    let mut on_page = vec![];
    for field in fields {
        if field.page_number < 1 || field.page_number as u32 > page_count {
            debug!("Field {} references page {} of {}, skipping", field.id, field.page_number, page_count);
            skipped.push(Skipped { field_id: field.id, reason: SkipReason::PageOutOfRange });
        } else {
            on_page.push(field);
        }
    }
    on_page.sort_by_key(|f| f.page_number);

    for (page_num, page_fields) in on_page.into_iter().group_by(|f| f.page_number as u32).into_iter() {
        let page_fields = page_fields.collect::<Vec<_>>();
        let page = match pdf_doc.page(page_num) {
            Ok(p) => p,
            Err(err) => {
                warn!("Unable to read page {}: {}", page_num, err);
                skipped.extend(page_fields.iter().map(|f| Skipped { field_id: f.id, reason: SkipReason::Page(err.to_string()) }));
                continue;
            }
        };

        let mut page_skipped = vec![];
        let drawn = page.setup(|page| {
            let mut drawn = vec![];
            for field in &page_fields {
                match draw_field(page, field, values, images) {
                    Ok(Some(rect)) => drawn.push(Placement { field_id: field.id, page_number: page_num, rect }),
                    Ok(None) => {}
                    Err(reason) => {
                        warn!("Skipping field {} on page {}: {:?}", field.id, page_num, reason);
                        page_skipped.push(Skipped { field_id: field.id, reason });
                    }
                }
            }
            drawn
        });

        match drawn {
            Ok(drawn) => {
                placements.extend(drawn);
                skipped.extend(page_skipped);
            }
            Err(err) => {
                warn!("Unable to update page {}: {}", page_num, err);
                skipped.extend(page_fields.iter().map(|f| Skipped { field_id: f.id, reason: SkipReason::Page(err.to_string()) }));
            }
        }
    }

    Ok(Baked {
        bytes: pdf_doc.finalise()?,
        placements,
        skipped,
    })
}

fn draw_field(
    page: &mut InnerDocumentPage, field: &DocumentField, values: &HashMap<uuid::Uuid, String>,
    images: &HashMap<uuid::Uuid, Vec<u8>>,
) -> Result<Option<PointRect>, SkipReason> {
    let rect = field.rect().clamped().ok_or(SkipReason::Geometry)?;
    let pos = rect.to_points(&page.page_box());
    let value = values.get(&field.id).map(String::as_str).unwrap_or("");
    let font_size = field.font_size as f64;

    match field.field_type {
        FieldType::Text | FieldType::Date | FieldType::Dropdown => {
            if value.is_empty() {
                return Ok(None);
            }
            let size = clamp(font_size, 8.0, 28.0);
            let drawn = page.add_text(
                value,
                pos.x + TEXT_INSET,
                pos.y + (pos.height - size) / 2.0,
                size,
                (pos.width - 2.0 * TEXT_INSET).max(0.0),
            );
            Ok(if drawn { Some(pos) } else { None })
        }
        FieldType::Checkbox => {
            if value != crate::fields::CHECKED {
                return Ok(None);
            }
            let size = clamp(font_size, 8.0, 18.0);
            let box_x = pos.x + 2.0;
            let box_y = pos.y + (pos.height - size) / 2.0;
            page.add_checkmark_box(box_x, box_y, size);
            if !field.label.is_empty() {
                let label_size = clamp(font_size, 8.0, 16.0);
                page.add_text(
                    &field.label,
                    box_x + size + TEXT_INSET,
                    box_y + (size - label_size) / 2.0,
                    label_size,
                    (pos.width - size - 2.0 * TEXT_INSET).max(0.0),
                );
            }
            Ok(Some(pos))
        }
        FieldType::Signature | FieldType::Initials => {
            let bytes = match images.get(&field.id) {
                Some(b) => b,
                None => return Ok(None),
            };
            let img = page.doc.png_to_xobj(bytes).map_err(|e| SkipReason::Image(e.to_string()))?;
            let scale = (pos.width / img.width as f64).min(pos.height / img.height as f64);
            let draw_width = img.width as f64 * scale;
            let draw_height = img.height as f64 * scale;
            let target = PointRect {
                x: pos.x + (pos.width - draw_width) / 2.0,
                y: pos.y + (pos.height - draw_height) / 2.0,
                width: draw_width,
                height: draw_height,
            };
            page.add_image(format!("Im{}", field.id.simple()), &img, &target);
            Ok(Some(pos))
        }
    }
}

fn zlib(data: &[u8]) -> Result<Vec<u8>, PdfError> {
    let mut encoder = deflate::write::ZlibEncoder::new(Vec::new(), deflate::Compression::Default);
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn obj_to_f64(obj: &lopdf::Object) -> Option<f64> {
    match obj {
        lopdf::Object::Integer(i) => Some(*i as f64),
        lopdf::Object::Real(f) => Some((*f).into()),
        _ => None,
    }
}

/// Maps text onto the WinAnsi code points the standard Helvetica font
/// covers; anything outside Latin-1 becomes `?`.
fn encode_win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .filter(|c| !c.is_control())
        .map(|c| match c as u32 {
            0x20..=0x7e | 0xa0..=0xff => c as u32 as u8,
            0x2018 | 0x2019 => b'\'',
            0x201c | 0x201d => b'"',
            0x2013 => 0x96,
            0x2014 => 0x97,
            0x2022 => 0x95,
            0x20ac => 0x80,
            _ => b'?',
        })
        .collect()
}

/// Helvetica advance widths in thousandths of an em.
fn helvetica_width(byte: u8) -> u16 {
    const ASCII: [u16; 95] = [
        278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278,
        556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556,
        1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778,
        667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556,
        333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556,
        556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584,
    ];
    match byte {
        0x20..=0x7e => ASCII[(byte - 0x20) as usize],
        0x97 => 1000,
        0x95 => 350,
        _ => 556,
    }
}

fn text_width(text: &[u8], size: f64) -> f64 {
    text.iter().map(|b| helvetica_width(*b) as f64).sum::<f64>() * size / 1000.0
}

/// The longest prefix of `text` no wider than `max_width`.
fn fit_text(text: &[u8], size: f64, max_width: f64) -> &[u8] {
    if text_width(text, size) <= max_width {
        return text;
    }
    let mut width = 0.0;
    for (i, b) in text.iter().enumerate() {
        width += helvetica_width(*b) as f64 * size / 1000.0;
        if width > max_width {
            return &text[..i];
        }
    }
    text
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::schema::FieldValidation;

    pub(crate) fn blank_pdf(page_sizes: &[(i64, i64)]) -> Vec<u8> {
        let mut doc = lopdf::Document::with_version("1.7");
        let pages_id = doc.new_object_id();
        let mut kids = vec![];
        for (w, h) in page_sizes {
            let content_id = doc.add_object(lopdf::Stream::new(dictionary! {}, b"1 w".to_vec()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), (*w).into(), (*h).into()],
                "Contents" => content_id,
            });
            kids.push(lopdf::Object::Reference(page_id));
        }
        let count = kids.len() as i64;
        doc.objects.insert(pages_id, lopdf::Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => dictionary! {},
        }));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buffer = Vec::new();
        doc.save_to(&mut buffer).unwrap();
        buffer
    }

    pub(crate) fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, width, height);
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            let data = (0..width * height).flat_map(|i| [0, 0, 0, (i % 256) as u8]).collect::<Vec<u8>>();
            writer.write_image_data(&data).unwrap();
        }
        out
    }

    pub(crate) fn field(field_type: FieldType, page_number: i32, x: f64, y: f64, w: f64, h: f64) -> DocumentField {
        DocumentField {
            id: uuid::Uuid::new_v4(),
            document_id: uuid::Uuid::nil(),
            field_type,
            label: String::new(),
            placeholder: None,
            required: false,
            validation: FieldValidation::None,
            font_size: 12,
            page_number,
            position_x: x,
            position_y: y,
            width: w,
            height: h,
            options: vec![],
            created_at: chrono::Utc::now(),
        }
    }

    fn operators(pdf: &[u8], page: u32) -> Vec<String> {
        let doc = lopdf::Document::load_mem(pdf).unwrap();
        let page_id = doc.get_pages()[&page];
        doc.get_and_decode_page_content(page_id)
            .unwrap()
            .operations
            .into_iter()
            .map(|op| op.operator)
            .collect()
    }

    #[test]
    fn corrupt_base_is_fatal() {
        let res = bake(b"definitely not a pdf", &[], &HashMap::new(), &HashMap::new());
        assert!(matches!(res, Err(PdfError::Parse(_))));
    }

    #[test]
    fn text_is_placed_with_flipped_axis() {
        let base = blank_pdf(&[(612, 792)]);
        let f = field(FieldType::Text, 1, 10.0, 10.0, 40.0, 5.0);
        let values = HashMap::from([(f.id, "Jane Doe".to_string())]);

        let baked = bake(&base, &[f.clone()], &values, &HashMap::new()).unwrap();
        assert!(baked.skipped.is_empty());
        assert_eq!(baked.placements.len(), 1);
        let rect = baked.placements[0].rect;
        assert!((rect.x - 61.2).abs() < 1e-9);
        assert!((rect.y - (792.0 - 79.2 - 39.6)).abs() < 1e-9);

        let ops = operators(&baked.bytes, 1);
        assert!(ops.contains(&"Tj".to_string()));
        // original content stays wrapped in its own graphics state
        assert_eq!(ops.first().map(String::as_str), Some("q"));
    }

    #[test]
    fn dropdown_choice_is_written() {
        let base = blank_pdf(&[(612, 792)]);
        let mut choice = field(FieldType::Dropdown, 1, 20.0, 40.0, 30.0, 5.0);
        choice.options = vec!["Option 1".to_string(), "Option 2".to_string()];
        let values = HashMap::from([(choice.id, "Option 2".to_string())]);

        let baked = bake(&base, &[choice.clone()], &values, &HashMap::new()).unwrap();
        assert!(baked.skipped.is_empty());
        assert_eq!(baked.placements.len(), 1);
        assert_eq!(baked.placements[0].field_id, choice.id);
        assert!((baked.placements[0].rect.x - 122.4).abs() < 1e-9);

        let doc = lopdf::Document::load_mem(&baked.bytes).unwrap();
        let content = doc.get_and_decode_page_content(doc.get_pages()[&1]).unwrap();
        let shown = content.operations.iter()
            .filter(|op| op.operator == "Tj")
            .map(|op| op.operands[0].as_str().unwrap().to_vec())
            .collect::<Vec<_>>();
        assert_eq!(shown, vec![b"Option 2".to_vec()]);
    }

    #[test]
    fn unwritable_page_reports_each_field_once() {
        let mut doc = lopdf::Document::with_version("1.7");
        let pages_id = doc.new_object_id();
        let broken_resources = doc.add_object(lopdf::Object::Integer(7));
        let content_id = doc.add_object(lopdf::Stream::new(dictionary! {}, b"1 w".to_vec()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => broken_resources,
        });
        doc.objects.insert(pages_id, lopdf::Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![lopdf::Object::Reference(page_id)],
            "Count" => 1,
        }));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut base = Vec::new();
        doc.save_to(&mut base).unwrap();

        let bad_sig = field(FieldType::Signature, 1, 10.0, 10.0, 20.0, 8.0);
        let text = field(FieldType::Text, 1, 10.0, 30.0, 40.0, 5.0);
        let values = HashMap::from([(text.id, "Jane".to_string())]);
        let images = HashMap::from([(bad_sig.id, b"not a png".to_vec())]);

        let baked = bake(&base, &[bad_sig.clone(), text.clone()], &values, &images).unwrap();
        assert!(baked.placements.is_empty());
        assert_eq!(baked.skipped.len(), 2);
        assert!(baked.skipped.iter().all(|s| matches!(s.reason, SkipReason::Page(_))));
        assert!(baked.skipped.iter().any(|s| s.field_id == bad_sig.id));
        assert!(baked.skipped.iter().any(|s| s.field_id == text.id));
    }

    #[test]
    fn empty_values_draw_nothing() {
        let base = blank_pdf(&[(612, 792)]);
        let text = field(FieldType::Text, 1, 10.0, 10.0, 40.0, 5.0);
        let check = field(FieldType::Checkbox, 1, 10.0, 20.0, 5.0, 5.0);
        let sig = field(FieldType::Signature, 1, 10.0, 30.0, 30.0, 8.0);
        let values = HashMap::from([(check.id, "false".to_string())]);

        let baked = bake(&base, &[text, check, sig], &values, &HashMap::new()).unwrap();
        assert!(baked.placements.is_empty());
        assert!(baked.skipped.is_empty());
        let ops = operators(&baked.bytes, 1);
        assert!(!ops.contains(&"Tj".to_string()));
        assert!(!ops.contains(&"re".to_string()));
    }

    #[test]
    fn checked_checkbox_draws_box_mark_and_label() {
        let base = blank_pdf(&[(612, 792)]);
        let mut check = field(FieldType::Checkbox, 1, 10.0, 20.0, 30.0, 5.0);
        check.label = "I agree".to_string();
        let values = HashMap::from([(check.id, "true".to_string())]);

        let baked = bake(&base, &[check], &values, &HashMap::new()).unwrap();
        assert_eq!(baked.placements.len(), 1);
        let ops = operators(&baked.bytes, 1);
        assert_eq!(ops.iter().filter(|o| *o == "re").count(), 1);
        assert_eq!(ops.iter().filter(|o| *o == "l").count(), 2);
        assert_eq!(ops.iter().filter(|o| *o == "Tj").count(), 1);
    }

    #[test]
    fn signature_is_scaled_and_centred() {
        let base = blank_pdf(&[(600, 800)]);
        let sig = field(FieldType::Signature, 1, 0.0, 0.0, 50.0, 10.0);
        let images = HashMap::from([(sig.id, png(200, 50))]);

        let baked = bake(&base, &[sig.clone()], &HashMap::new(), &images).unwrap();
        assert!(baked.skipped.is_empty());

        let doc = lopdf::Document::load_mem(&baked.bytes).unwrap();
        let page_id = doc.get_pages()[&1];
        let content = doc.get_and_decode_page_content(page_id).unwrap();
        let cm = content.operations.iter().find(|op| op.operator == "cm").unwrap();
        let nums = cm.operands.iter().map(|o| obj_to_f64(o).unwrap()).collect::<Vec<_>>();
        // 300x80pt box, 200x50px image: width bound gives 300x75
        assert!((nums[0] - 300.0).abs() < 1e-3);
        assert!((nums[3] - 75.0).abs() < 1e-3);
        assert!((nums[4] - 0.0).abs() < 1e-3);
        assert!((nums[5] - (720.0 + 2.5)).abs() < 1e-3);
    }

    #[test]
    fn bad_image_and_stale_page_are_skipped() {
        let base = blank_pdf(&[(612, 792)]);
        let bad_sig = field(FieldType::Signature, 1, 10.0, 10.0, 20.0, 8.0);
        let stale = field(FieldType::Text, 3, 10.0, 10.0, 20.0, 8.0);
        let good = field(FieldType::Date, 1, 10.0, 50.0, 20.0, 6.0);
        let values = HashMap::from([
            (stale.id, "x".to_string()),
            (good.id, "2024-05-01".to_string()),
        ]);
        let images = HashMap::from([(bad_sig.id, b"not a png".to_vec())]);

        let baked = bake(&base, &[bad_sig.clone(), stale.clone(), good.clone()], &values, &images).unwrap();
        assert_eq!(baked.placements.len(), 1);
        assert_eq!(baked.placements[0].field_id, good.id);
        assert!(baked.skipped.contains(&Skipped { field_id: stale.id, reason: SkipReason::PageOutOfRange }));
        assert!(baked.skipped.iter().any(|s| s.field_id == bad_sig.id && matches!(s.reason, SkipReason::Image(_))));
    }

    #[test]
    fn overflowing_geometry_is_clamped_not_fatal() {
        let base = blank_pdf(&[(612, 792)]);
        let wide = field(FieldType::Text, 1, 90.0, 10.0, 30.0, 5.0);
        let gone = field(FieldType::Text, 1, 150.0, 10.0, 30.0, 5.0);
        let values = HashMap::from([(wide.id, "W".to_string()), (gone.id, "G".to_string())]);

        let baked = bake(&base, &[wide.clone(), gone.clone()], &values, &HashMap::new()).unwrap();
        assert_eq!(baked.placements.len(), 1);
        assert!((baked.placements[0].rect.width - 61.2).abs() < 1e-9);
        assert_eq!(baked.skipped, vec![Skipped { field_id: gone.id, reason: SkipReason::Geometry }]);
    }

    #[test]
    fn mixed_page_sizes_use_their_own_boxes() {
        let base = blank_pdf(&[(612, 792), (842, 595)]);
        let a = field(FieldType::Text, 1, 50.0, 50.0, 10.0, 10.0);
        let b = field(FieldType::Text, 2, 50.0, 50.0, 10.0, 10.0);
        let values = HashMap::from([(a.id, "a".to_string()), (b.id, "b".to_string())]);

        let baked = bake(&base, &[a, b], &values, &HashMap::new()).unwrap();
        let rects = baked.placements.iter().map(|p| p.rect).collect::<Vec<_>>();
        assert!((rects[0].x - 306.0).abs() < 1e-9);
        assert!((rects[1].x - 421.0).abs() < 1e-9);
        assert!((rects[1].height - 59.5).abs() < 1e-9);
    }

    #[test]
    fn baking_is_reproducible() {
        let base = blank_pdf(&[(612, 792), (612, 792)]);
        let t = field(FieldType::Text, 2, 12.5, 33.3, 40.0, 5.0);
        let s = field(FieldType::Initials, 1, 70.0, 90.0, 12.0, 6.0);
        let c = field(FieldType::Checkbox, 1, 5.0, 5.0, 6.0, 6.0);
        let fields = vec![t.clone(), s.clone(), c.clone()];
        let values = HashMap::from([(t.id, "hello".to_string()), (c.id, "true".to_string())]);
        let images = HashMap::from([(s.id, png(40, 20))]);

        let first = bake(&base, &fields, &values, &images).unwrap();
        let second = bake(&base, &fields, &values, &images).unwrap();
        assert_eq!(first.placements, second.placements);
        assert_eq!(first.placements.len(), 3);
        assert_eq!(operators(&first.bytes, 1), operators(&second.bytes, 1));
    }

    #[test]
    fn text_is_truncated_to_box() {
        let long = "W".repeat(200);
        let fitted = fit_text(long.as_bytes(), 10.0, 100.0);
        assert!(text_width(fitted, 10.0) <= 100.0);
        assert!(text_width(&long.as_bytes()[..fitted.len() + 1], 10.0) > 100.0);
        assert!(fit_text(b"abc", 10.0, 0.0).is_empty());
    }

    #[test]
    fn win_ansi_encoding() {
        assert_eq!(encode_win_ansi("Café"), vec![b'C', b'a', b'f', 0xe9]);
        assert_eq!(encode_win_ansi("漢"), b"?".to_vec());
        assert_eq!(encode_win_ansi("a\nb"), b"ab".to_vec());
    }
}
