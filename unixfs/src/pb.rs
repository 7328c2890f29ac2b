#![allow(non_snake_case)]

//! Hand-written dag-pb and UnixFS protobuf support on top of `quick-protobuf`.
//!
//! The encoded form follows go-merkledag conventions: links are written before
//! the data field so that a tree built here has the same bytes, and therefore
//! the same identifiers, as one built by the reference implementations.

use quick_protobuf::sizeofs::*;
use quick_protobuf::{BytesReader, MessageRead, MessageWrite, Writer, WriterBackend};
use std::borrow::Cow;
use std::convert::TryFrom;
use std::fmt;

/// The node types found in the UnixFS data field.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UnixFsType {
    Raw,
    Directory,
    File,
    Metadata,
    Symlink,
    HAMTShard,
}

impl Default for UnixFsType {
    fn default() -> Self {
        UnixFsType::Raw
    }
}

impl From<i32> for UnixFsType {
    fn from(i: i32) -> Self {
        match i {
            0 => UnixFsType::Raw,
            1 => UnixFsType::Directory,
            2 => UnixFsType::File,
            3 => UnixFsType::Metadata,
            4 => UnixFsType::Symlink,
            5 => UnixFsType::HAMTShard,
            _ => Self::default(),
        }
    }
}

impl From<UnixFsType> for i32 {
    fn from(t: UnixFsType) -> Self {
        match t {
            UnixFsType::Raw => 0,
            UnixFsType::Directory => 1,
            UnixFsType::File => 2,
            UnixFsType::Metadata => 3,
            UnixFsType::Symlink => 4,
            UnixFsType::HAMTShard => 5,
        }
    }
}

/// Last modification time as stored in UnixFS metadata.
#[derive(Debug, Default, PartialEq, Clone)]
pub struct UnixTime {
    pub Seconds: i64,
    pub FractionalNanoseconds: Option<u32>,
}

impl<'a> MessageRead<'a> for UnixTime {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> quick_protobuf::Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.Seconds = r.read_int64(bytes)?,
                Ok(21) => msg.FractionalNanoseconds = Some(r.read_fixed32(bytes)?),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for UnixTime {
    fn get_size(&self) -> usize {
        1 + sizeof_int64(self.Seconds)
            + self.FractionalNanoseconds.map_or(0, |_| 1 + 4)
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> quick_protobuf::Result<()> {
        w.write_with_tag(8, |w| w.write_int64(self.Seconds))?;
        if let Some(ns) = self.FractionalNanoseconds {
            w.write_with_tag(21, |w| w.write_fixed32(ns))?;
        }
        Ok(())
    }
}

/// The UnixFS message carried in the data field of a dag-pb node.
#[derive(Debug, Default, PartialEq, Clone)]
pub struct UnixFs<'a> {
    pub Type: UnixFsType,
    pub Data: Option<Cow<'a, [u8]>>,
    pub filesize: Option<u64>,
    pub blocksizes: Vec<u64>,
    pub hashType: Option<u64>,
    pub fanout: Option<u64>,
    pub mode: Option<u32>,
    pub mtime: Option<UnixTime>,
}

impl<'a> MessageRead<'a> for UnixFs<'a> {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> quick_protobuf::Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.Type = r.read_enum(bytes)?,
                Ok(18) => msg.Data = Some(Cow::Borrowed(r.read_bytes(bytes)?)),
                Ok(24) => msg.filesize = Some(r.read_uint64(bytes)?),
                Ok(32) => msg.blocksizes.push(r.read_uint64(bytes)?),
                Ok(34) => {
                    // tolerate the packed wire form some encoders produce
                    let mut packed = r.read_packed(bytes, |r, bytes| r.read_uint64(bytes))?;
                    msg.blocksizes.append(&mut packed);
                }
                Ok(40) => msg.hashType = Some(r.read_uint64(bytes)?),
                Ok(48) => msg.fanout = Some(r.read_uint64(bytes)?),
                Ok(56) => msg.mode = Some(r.read_uint32(bytes)?),
                Ok(66) => msg.mtime = Some(r.read_message::<UnixTime>(bytes)?),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl<'a> MessageWrite for UnixFs<'a> {
    fn get_size(&self) -> usize {
        1 + sizeof_varint(i32::from(self.Type) as u64)
            + self.Data.as_ref().map_or(0, |d| 1 + sizeof_len(d.len()))
            + self.filesize.map_or(0, |v| 1 + sizeof_varint(v))
            + self
                .blocksizes
                .iter()
                .map(|v| 1 + sizeof_varint(*v))
                .sum::<usize>()
            + self.hashType.map_or(0, |v| 1 + sizeof_varint(v))
            + self.fanout.map_or(0, |v| 1 + sizeof_varint(v))
            + self.mode.map_or(0, |v| 1 + sizeof_varint(v as u64))
            + self
                .mtime
                .as_ref()
                .map_or(0, |m| 1 + sizeof_len(m.get_size()))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> quick_protobuf::Result<()> {
        w.write_with_tag(8, |w| w.write_enum(i32::from(self.Type)))?;
        if let Some(ref d) = self.Data {
            w.write_with_tag(18, |w| w.write_bytes(d))?;
        }
        if let Some(v) = self.filesize {
            w.write_with_tag(24, |w| w.write_uint64(v))?;
        }
        for v in &self.blocksizes {
            w.write_with_tag(32, |w| w.write_uint64(*v))?;
        }
        if let Some(v) = self.hashType {
            w.write_with_tag(40, |w| w.write_uint64(v))?;
        }
        if let Some(v) = self.fanout {
            w.write_with_tag(48, |w| w.write_uint64(v))?;
        }
        if let Some(v) = self.mode {
            w.write_with_tag(56, |w| w.write_uint32(v))?;
        }
        if let Some(ref m) = self.mtime {
            w.write_with_tag(66, |w| w.write_message(m))?;
        }
        Ok(())
    }
}

/// A named, sized link to another dag-pb node.
#[derive(Debug, Default, PartialEq, Clone)]
pub struct PBLink<'a> {
    pub Hash: Option<Cow<'a, [u8]>>,
    pub Name: Option<Cow<'a, str>>,
    pub Tsize: Option<u64>,
}

impl<'a> MessageRead<'a> for PBLink<'a> {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> quick_protobuf::Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.Hash = Some(Cow::Borrowed(r.read_bytes(bytes)?)),
                Ok(18) => msg.Name = Some(Cow::Borrowed(r.read_string(bytes)?)),
                Ok(24) => msg.Tsize = Some(r.read_uint64(bytes)?),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl<'a> MessageWrite for PBLink<'a> {
    fn get_size(&self) -> usize {
        self.Hash.as_ref().map_or(0, |h| 1 + sizeof_len(h.len()))
            + self.Name.as_ref().map_or(0, |n| 1 + sizeof_len(n.len()))
            + self.Tsize.map_or(0, |v| 1 + sizeof_varint(v))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> quick_protobuf::Result<()> {
        if let Some(ref h) = self.Hash {
            w.write_with_tag(10, |w| w.write_bytes(h))?;
        }
        if let Some(ref n) = self.Name {
            w.write_with_tag(18, |w| w.write_string(n))?;
        }
        if let Some(v) = self.Tsize {
            w.write_with_tag(24, |w| w.write_uint64(v))?;
        }
        Ok(())
    }
}

/// Raw dag-pb node: data bytes plus links, before any UnixFS interpretation.
#[derive(Debug, Default, PartialEq, Clone)]
pub struct PBNode<'a> {
    pub Data: Option<Cow<'a, [u8]>>,
    pub Links: Vec<PBLink<'a>>,
}

impl<'a> MessageRead<'a> for PBNode<'a> {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> quick_protobuf::Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.Data = Some(Cow::Borrowed(r.read_bytes(bytes)?)),
                Ok(18) => msg.Links.push(r.read_message::<PBLink>(bytes)?),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

/// A dag-pb node whose data field has been parsed as UnixFS.
///
/// Serializing writes the links before the data field; both go-merkledag and
/// js-ipfs emit that order, and CID equality for equal trees depends on it.
#[derive(Debug)]
pub struct FlatUnixFs<'a> {
    pub links: Vec<PBLink<'a>>,
    pub data: UnixFs<'a>,
}

impl<'a> FlatUnixFs<'a> {
    /// Serializes into `out`, clearing any previous contents.
    pub fn serialize(&self, out: &mut Vec<u8>) -> Result<(), quick_protobuf::Error> {
        out.clear();
        out.reserve(self.get_size());
        let mut writer = Writer::new(out);
        self.write_message(&mut writer)
    }
}

impl<'a> MessageWrite for FlatUnixFs<'a> {
    fn get_size(&self) -> usize {
        self.links
            .iter()
            .map(|l| 1 + sizeof_len(l.get_size()))
            .sum::<usize>()
            + 1
            + sizeof_len(self.data.get_size())
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> quick_protobuf::Result<()> {
        for link in &self.links {
            w.write_with_tag(18, |w| w.write_message(link))?;
        }
        w.write_with_tag(10, |w| w.write_message(&self.data))?;
        Ok(())
    }
}

impl<'a> TryFrom<&'a [u8]> for FlatUnixFs<'a> {
    type Error = UnixFsReadFailed;

    fn try_from(data: &'a [u8]) -> Result<Self, Self::Error> {
        let mut reader = BytesReader::from_bytes(data);
        let node =
            PBNode::from_reader(&mut reader, data).map_err(UnixFsReadFailed::InvalidDagPb)?;

        let inner = match node.Data {
            Some(Cow::Borrowed(bytes)) => bytes,
            Some(Cow::Owned(_)) => unreachable!("the reader only borrows"),
            None => return Err(UnixFsReadFailed::NoData),
        };

        let mut reader = BytesReader::from_bytes(inner);
        let data =
            UnixFs::from_reader(&mut reader, inner).map_err(UnixFsReadFailed::InvalidUnixFs)?;

        Ok(FlatUnixFs {
            links: node.Links,
            data,
        })
    }
}

/// Errors from decoding a block as a dag-pb UnixFS node.
#[derive(Debug)]
pub enum UnixFsReadFailed {
    InvalidDagPb(quick_protobuf::Error),
    /// The outer node carried no data field to interpret as UnixFS.
    NoData,
    InvalidUnixFs(quick_protobuf::Error),
}

impl fmt::Display for UnixFsReadFailed {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use UnixFsReadFailed::*;

        match self {
            InvalidDagPb(e) => write!(fmt, "failed to decode dag-pb: {}", e),
            NoData => write!(fmt, "dag-pb node has no data to decode as UnixFS"),
            InvalidUnixFs(e) => write!(fmt, "failed to decode UnixFS data: {}", e),
        }
    }
}

impl std::error::Error for UnixFsReadFailed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use UnixFsReadFailed::*;

        match self {
            InvalidDagPb(e) | InvalidUnixFs(e) => Some(e),
            NoData => None,
        }
    }
}
