//! Reader and writer for the gzip-compressed named-binary-tag format used
//! by the world save files.
//!
//! Tag type legend: 0=End, 1=Byte, 2=Short, 3=Int, 4=Long, 5=Float,
//! 6=Double, 7=ByteArray, 8=String, 9=List, 10=Compound.

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

pub const TAG_END: u8 = 0;
pub const TAG_BYTE: u8 = 1;
pub const TAG_SHORT: u8 = 2;
pub const TAG_INT: u8 = 3;
pub const TAG_LONG: u8 = 4;
pub const TAG_FLOAT: u8 = 5;
pub const TAG_DOUBLE: u8 = 6;
pub const TAG_BYTE_ARRAY: u8 = 7;
pub const TAG_STRING: u8 = 8;
pub const TAG_LIST: u8 = 9;
pub const TAG_COMPOUND: u8 = 10;

#[derive(Error, Debug)]
pub enum NbtError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid tag type {0:#04x}")]
    InvalidTagType(u8),
    #[error("negative length {0}")]
    NegativeLength(i32),
    #[error("string is not utf-8")]
    InvalidString,
    #[error("root tag is not a named compound")]
    RootNotCompound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    End,
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    ByteArray(Vec<u8>),
    String(String),
    List(Vec<Tag>),
    Compound(HashMap<String, Tag>),
}

/// A tag together with its name. The document root is always a named
/// compound (usually named `""` in save files).
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTag {
    pub name: String,
    pub tag: Tag,
}

impl Tag {
    pub fn type_id(&self) -> u8 {
        match self {
            Tag::End => TAG_END,
            Tag::Byte(_) => TAG_BYTE,
            Tag::Short(_) => TAG_SHORT,
            Tag::Int(_) => TAG_INT,
            Tag::Long(_) => TAG_LONG,
            Tag::Float(_) => TAG_FLOAT,
            Tag::Double(_) => TAG_DOUBLE,
            Tag::ByteArray(_) => TAG_BYTE_ARRAY,
            Tag::String(_) => TAG_STRING,
            Tag::List(_) => TAG_LIST,
            Tag::Compound(_) => TAG_COMPOUND,
        }
    }
}

impl NamedTag {
    /// Descend a slash-delimited path. The first component must match the
    /// root's own name; every intermediate component must be a compound.
    /// Anything else is "not found".
    pub fn lookup(&self, path: &str) -> Option<&Tag> {
        let mut parts = path.split('/');
        match parts.next() {
            Some(first) if first == self.name => {}
            _ => return None,
        }

        let mut current = &self.tag;
        for part in parts {
            match current {
                Tag::Compound(tags) => current = tags.get(part)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

/// Decode a single gzip-compressed named compound.
pub fn read<R: Read>(reader: R) -> Result<NamedTag, NbtError> {
    let mut gz = GzDecoder::new(reader);
    let root = read_named(&mut gz)?;
    if !matches!(root.tag, Tag::Compound(_)) {
        return Err(NbtError::RootNotCompound);
    }
    Ok(root)
}

/// Encode a named tag as a gzip stream, the inverse of [`read`].
pub fn write<W: Write>(writer: W, root: &NamedTag) -> Result<(), NbtError> {
    let mut gz = GzEncoder::new(writer, Compression::default());
    write_named(&mut gz, root)?;
    gz.finish()?;
    Ok(())
}

fn read_named<R: Read>(r: &mut R) -> Result<NamedTag, NbtError> {
    let tag_type = read_u8(r)?;
    if tag_type == TAG_END {
        return Ok(NamedTag {
            name: String::new(),
            tag: Tag::End,
        });
    }
    let name = read_string(r)?;
    let tag = read_payload(r, tag_type)?;
    Ok(NamedTag { name, tag })
}

fn read_payload<R: Read>(r: &mut R, tag_type: u8) -> Result<Tag, NbtError> {
    match tag_type {
        TAG_END => Ok(Tag::End),
        TAG_BYTE => Ok(Tag::Byte(read_u8(r)? as i8)),
        TAG_SHORT => Ok(Tag::Short(read_i16(r)?)),
        TAG_INT => Ok(Tag::Int(read_i32(r)?)),
        TAG_LONG => Ok(Tag::Long(read_i64(r)?)),
        TAG_FLOAT => Ok(Tag::Float(f32::from_bits(read_i32(r)? as u32))),
        TAG_DOUBLE => Ok(Tag::Double(f64::from_bits(read_i64(r)? as u64))),
        TAG_BYTE_ARRAY => {
            let length = read_i32(r)?;
            if length < 0 {
                return Err(NbtError::NegativeLength(length));
            }
            let mut data = vec![0u8; length as usize];
            r.read_exact(&mut data)?;
            Ok(Tag::ByteArray(data))
        }
        TAG_STRING => Ok(Tag::String(read_string(r)?)),
        TAG_LIST => {
            let elem_type = read_u8(r)?;
            if elem_type > TAG_COMPOUND {
                return Err(NbtError::InvalidTagType(elem_type));
            }
            let length = read_i32(r)?;
            if length < 0 {
                return Err(NbtError::NegativeLength(length));
            }
            let mut items = Vec::with_capacity(length.min(1024) as usize);
            for _ in 0..length {
                items.push(read_payload(r, elem_type)?);
            }
            Ok(Tag::List(items))
        }
        TAG_COMPOUND => {
            let mut tags = HashMap::new();
            loop {
                let child = read_named(r)?;
                if matches!(child.tag, Tag::End) {
                    break;
                }
                tags.insert(child.name, child.tag);
            }
            Ok(Tag::Compound(tags))
        }
        other => Err(NbtError::InvalidTagType(other)),
    }
}

fn write_named<W: Write>(w: &mut W, named: &NamedTag) -> Result<(), NbtError> {
    w.write_all(&[named.tag.type_id()])?;
    if !matches!(named.tag, Tag::End) {
        write_string(w, &named.name)?;
        write_payload(w, &named.tag)?;
    }
    Ok(())
}

fn write_payload<W: Write>(w: &mut W, tag: &Tag) -> Result<(), NbtError> {
    match tag {
        Tag::End => {}
        Tag::Byte(v) => w.write_all(&[*v as u8])?,
        Tag::Short(v) => w.write_all(&v.to_be_bytes())?,
        Tag::Int(v) => w.write_all(&v.to_be_bytes())?,
        Tag::Long(v) => w.write_all(&v.to_be_bytes())?,
        Tag::Float(v) => w.write_all(&v.to_be_bytes())?,
        Tag::Double(v) => w.write_all(&v.to_be_bytes())?,
        Tag::ByteArray(data) => {
            w.write_all(&(data.len() as i32).to_be_bytes())?;
            w.write_all(data)?;
        }
        Tag::String(s) => write_string(w, s)?,
        Tag::List(items) => {
            let elem_type = items.first().map(Tag::type_id).unwrap_or(TAG_END);
            w.write_all(&[elem_type])?;
            w.write_all(&(items.len() as i32).to_be_bytes())?;
            for item in items {
                write_payload(w, item)?;
            }
        }
        Tag::Compound(tags) => {
            for (name, child) in tags {
                write_named(
                    w,
                    &NamedTag {
                        name: name.clone(),
                        tag: child.clone(),
                    },
                )?;
            }
            w.write_all(&[TAG_END])?;
        }
    }
    Ok(())
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, NbtError> {
    let mut raw = [0u8; 1];
    r.read_exact(&mut raw)?;
    Ok(raw[0])
}

fn read_i16<R: Read>(r: &mut R) -> Result<i16, NbtError> {
    let mut raw = [0u8; 2];
    r.read_exact(&mut raw)?;
    Ok(i16::from_be_bytes(raw))
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32, NbtError> {
    let mut raw = [0u8; 4];
    r.read_exact(&mut raw)?;
    Ok(i32::from_be_bytes(raw))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64, NbtError> {
    let mut raw = [0u8; 8];
    r.read_exact(&mut raw)?;
    Ok(i64::from_be_bytes(raw))
}

fn read_string<R: Read>(r: &mut R) -> Result<String, NbtError> {
    let length = read_i16(r)?;
    if length < 0 {
        return Err(NbtError::NegativeLength(length as i32));
    }
    let mut raw = vec![0u8; length as usize];
    r.read_exact(&mut raw)?;
    String::from_utf8(raw).map_err(|_| NbtError::InvalidString)
}

fn write_string<W: Write>(w: &mut W, s: &str) -> Result<(), NbtError> {
    w.write_all(&(s.len() as i16).to_be_bytes())?;
    w.write_all(s.as_bytes())?;
    Ok(())
}
