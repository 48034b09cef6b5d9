//! Encoding of stacked images as FITS files.
//!
//! The output is a single primary HDU of 16 bit integers. FITS has no
//! unsigned 16 bit type, so samples are stored offset by `BZERO = 32768`:
//! each sample `p` is written as the big-endian `i16` value `p - 32768`.
//! Header and data are each padded to a multiple of 2880 bytes.

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};

use crate::accumulator::StackedImage;
use crate::{Error, Result};

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;
const BZERO: i32 = 32768;

const RESERVED: &[&str] = &[
    "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "EXTEND", "BZERO", "BSCALE", "END",
];

/// Serializes a stacked image plus metadata into a byte stream.
pub trait ImageEncoder: Send {
    fn encode(&self, image: &StackedImage, cards: &[HeaderCard]) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Logical(bool),
    Integer(i64),
    /// A float written with a fixed number of decimals.
    Real { value: f64, decimals: usize },
    Text(String),
}

/// One keyword = value / comment record.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderCard {
    pub key: String,
    pub value: HeaderValue,
    pub comment: String,
}

impl HeaderCard {
    pub fn new(key: &str, value: HeaderValue, comment: &str) -> Self {
        Self {
            key: key.to_string(),
            value,
            comment: comment.to_string(),
        }
    }

    pub fn text(key: &str, value: impl Into<String>, comment: &str) -> Self {
        Self::new(key, HeaderValue::Text(value.into()), comment)
    }

    pub fn integer(key: &str, value: i64, comment: &str) -> Self {
        Self::new(key, HeaderValue::Integer(value), comment)
    }

    pub fn real(key: &str, value: f64, decimals: usize, comment: &str) -> Self {
        Self::new(key, HeaderValue::Real { value, decimals }, comment)
    }

    fn logical(key: &str, value: bool, comment: &str) -> Self {
        Self::new(key, HeaderValue::Logical(value), comment)
    }

    /// Format as one 80 column card.
    fn render(&self) -> Result<String> {
        check_keyword(&self.key)?;
        let value = match &self.value {
            HeaderValue::Logical(v) => format!("{:>20}", if *v { "T" } else { "F" }),
            HeaderValue::Integer(v) => format!("{v:>20}"),
            HeaderValue::Real { value, decimals } => {
                if !value.is_finite() {
                    return Err(Error::Encode(format!(
                        "{} has non-finite value {value}",
                        self.key
                    )));
                }
                let decimals = *decimals;
                format!("{:>20}", format!("{value:.decimals$}"))
            }
            HeaderValue::Text(v) => quoted_text(v),
        };
        let mut card = format!("{:<8}= {value}", self.key);
        if !self.comment.is_empty() {
            card.push_str(" / ");
            card.push_str(&printable(&self.comment));
        }
        Ok(pad_card(card))
    }
}

fn printable(s: &str) -> String {
    s.chars()
        .map(|c| if (' '..='~').contains(&c) { c } else { '?' })
        .collect()
}

/// Longest escaped string that fits between the quotes after `KEYWORD = `.
const MAX_TEXT_LEN: usize = CARD_SIZE - 10 - 2;

/// A quoted string value, padded to 8 characters and cut to fit one card.
///
/// Quotes are doubled and never split by the cut.
fn quoted_text(v: &str) -> String {
    let mut escaped = String::new();
    for c in printable(v).chars() {
        let add = if c == '\'' { 2 } else { 1 };
        if escaped.len() + add > MAX_TEXT_LEN {
            break;
        }
        escaped.push(c);
        if c == '\'' {
            escaped.push('\'');
        }
    }
    format!("'{escaped:<8}'")
}

fn pad_card(mut card: String) -> String {
    card.truncate(CARD_SIZE);
    format!("{card:<CARD_SIZE$}")
}

/// Check that `key` is a valid header keyword: one to eight characters of
/// `A-Z`, `0-9`, `-` and `_`.
pub fn check_keyword(key: &str) -> Result<()> {
    let valid_chars = key
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if key.is_empty() || key.len() > 8 || !valid_chars {
        return Err(Error::Encode(format!("invalid header keyword \"{key}\"")));
    }
    Ok(())
}

fn pad_to_block(buf: &mut Vec<u8>, fill: u8) {
    let rem = buf.len() % BLOCK_SIZE;
    if rem != 0 {
        buf.resize(buf.len() + BLOCK_SIZE - rem, fill);
    }
}

/// Writes [StackedImage]s as FITS.
#[derive(Debug, Default, Clone, Copy)]
pub struct FitsEncoder;

impl FitsEncoder {
    fn header(&self, image: &StackedImage, cards: &[HeaderCard]) -> Result<Vec<u8>> {
        let mandatory = [
            HeaderCard::logical("SIMPLE", true, "Standard FITS"),
            HeaderCard::integer("BITPIX", 16, "16-bit data"),
            HeaderCard::integer("NAXIS", 2, "Number of axes"),
            HeaderCard::integer("NAXIS1", image.width.into(), "Number of pixel columns"),
            HeaderCard::integer("NAXIS2", image.height.into(), "Number of pixel rows"),
            HeaderCard::integer("BZERO", BZERO.into(), "Zero factor"),
            HeaderCard::integer("BSCALE", 1, "Scale factor"),
        ];

        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        for card in mandatory.iter() {
            buf.write_all(card.render()?.as_bytes())?;
        }
        for card in cards {
            if RESERVED.contains(&card.key.as_str()) {
                return Err(Error::Encode(format!(
                    "keyword {} is reserved for the image structure",
                    card.key
                )));
            }
            buf.write_all(card.render()?.as_bytes())?;
        }
        buf.write_all(pad_card("END".to_string()).as_bytes())?;
        pad_to_block(&mut buf, b' ');
        Ok(buf)
    }
}

impl ImageEncoder for FitsEncoder {
    fn encode(&self, image: &StackedImage, cards: &[HeaderCard]) -> Result<Vec<u8>> {
        let npix = image.width as usize * image.height as usize;
        if image.pixels.len() != npix {
            return Err(Error::Encode(format!(
                "{} samples for a {}x{} image",
                image.pixels.len(),
                image.width,
                image.height
            )));
        }

        let mut buf = self.header(image, cards)?;
        buf.reserve(npix * 2 + BLOCK_SIZE);
        for px in image.pixels.iter() {
            buf.write_i16::<BigEndian>((*px as i32 - BZERO) as i16)?;
        }
        pad_to_block(&mut buf, 0);
        Ok(buf)
    }
}
