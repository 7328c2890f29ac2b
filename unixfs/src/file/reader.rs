use crate::file::{FileError, FileReadFailed};
use crate::pb::{FlatUnixFs, PBLink, UnixFsType};
use crate::RAW;
use cid::Cid;
use std::borrow::Cow;
use std::convert::TryFrom;

/// Interprets a single block of a file tree, which is either a raw leaf (the block bytes are the
/// content), a single-block protobuf file, or an intermediary node spreading the content over
/// linked subtrees.
///
/// A file does not know its own name; names live on the links of the enclosing directory nodes.
pub struct FileReader<'a> {
    data: &'a [u8],
    links: Vec<PBLink<'a>>,
    blocksizes: Vec<u64>,
    filesize: u64,
}

impl<'a> FileReader<'a> {
    /// Starts reading from a block. The `cid` is needed to tell raw leaves apart from dag-pb
    /// encoded nodes.
    pub fn from_block(cid: &Cid, block: &'a [u8]) -> Result<Self, FileReadFailed> {
        if cid.codec() == RAW {
            return Ok(FileReader {
                data: block,
                links: Vec::new(),
                blocksizes: Vec::new(),
                filesize: block.len() as u64,
            });
        }

        let inner = FlatUnixFs::try_from(block)?;

        if inner.data.Type != UnixFsType::File && inner.data.Type != UnixFsType::Raw {
            return Err(FileReadFailed::UnexpectedType(inner.data.Type.into()));
        }

        if inner.links.len() != inner.data.blocksizes.len() {
            return Err(FileError::LinksAndBlocksizesMismatch.into());
        }

        if inner.links.is_empty() {
            let data = match inner.data.Data {
                Some(Cow::Borrowed(bytes)) => bytes,
                Some(Cow::Owned(_)) => unreachable!("the reader only borrows"),
                None => &[][..],
            };
            let filesize = inner.data.filesize.unwrap_or(data.len() as u64);

            if filesize != data.len() as u64 {
                return Err(FileError::NoLinksNoContent.into());
            }

            Ok(FileReader {
                data,
                links: Vec::new(),
                blocksizes: Vec::new(),
                filesize,
            })
        } else {
            let filesize = match inner.data.filesize {
                Some(filesize) => filesize,
                None => return Err(FileError::IntermediateNodeWithoutFileSize.into()),
            };

            let covered = inner.data.blocksizes.iter().sum::<u64>();
            if covered != filesize {
                return Err(FileError::SubtreeSizeMismatch {
                    expected: filesize,
                    actual: covered,
                }
                .into());
            }

            Ok(FileReader {
                data: &[][..],
                links: inner.links,
                blocksizes: inner.data.blocksizes,
                filesize,
            })
        }
    }

    /// Number of file bytes this block and its subtrees cover.
    pub fn file_size(&self) -> u64 {
        self.filesize
    }

    /// Consumes the reader into the block content: either the inline bytes of a leaf or the links
    /// to the subtrees which spread the content, each paired with its advertised byte coverage.
    pub fn content(self) -> Result<FileContent<'a>, FileReadFailed> {
        if self.links.is_empty() {
            return Ok(FileContent::Just(self.data));
        }

        let mut spread = Vec::with_capacity(self.links.len());

        for (nth, (link, blocksize)) in self
            .links
            .into_iter()
            .zip(self.blocksizes.into_iter())
            .enumerate()
        {
            spread.push((to_cid(nth, link)?, blocksize));
        }

        Ok(FileContent::Spread(spread))
    }
}

fn to_cid(nth: usize, link: PBLink<'_>) -> Result<Cid, FileReadFailed> {
    let hash = link.Hash.as_deref().unwrap_or_default();
    let hash_vec = hash.to_vec();

    Cid::try_from(hash).map_err(|cause| FileReadFailed::LinkInvalidCid {
        nth,
        hash: hash_vec,
        name: match link.Name {
            Some(Cow::Borrowed(x)) => Cow::Owned(String::from(x)),
            Some(Cow::Owned(x)) => Cow::Owned(x),
            None => Cow::Borrowed(""),
        },
        cause,
    })
}

/// Content of a single file tree block.
#[derive(Debug)]
pub enum FileContent<'a> {
    /// The leaf level of the DAG, actual content. For empty files this is an empty slice.
    Just(&'a [u8]),
    /// The content is spread over subtrees; each entry covers the given number of file bytes, in
    /// file byte order.
    Spread(Vec<(Cid, u64)>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag_pb_cid;

    // single block file with b"content", from the conformance corpus
    const CONTENT_FILE: &[u8] = &[
        0x0a, 0x0d, 0x08, 0x02, 0x12, 0x07, 0x63, 0x6f, 0x6e, 0x74, 0x65, 0x6e, 0x74, 0x18, 0x07,
    ];

    #[test]
    fn just_content() {
        let cid = dag_pb_cid(CONTENT_FILE);
        let fr = FileReader::from_block(&cid, CONTENT_FILE).unwrap();

        assert_eq!(fr.file_size(), 7);
        match fr.content().unwrap() {
            FileContent::Just(b"content") => {}
            x => panic!("unexpected: {:?}", x),
        }
    }

    #[test]
    fn empty_file() {
        let block = &[0x0a, 0x04, 0x08, 0x02, 0x18, 0x00];
        let cid = dag_pb_cid(block);
        let fr = FileReader::from_block(&cid, block).unwrap();
        assert_eq!(fr.file_size(), 0);
        match fr.content().unwrap() {
            FileContent::Just(b"") => {}
            x => panic!("unexpected: {:?}", x),
        }
    }

    #[test]
    fn raw_leaf_is_all_content() {
        let payload = b"anything goes";
        let cid = crate::raw_cid(payload);
        let fr = FileReader::from_block(&cid, payload).unwrap();
        assert_eq!(fr.file_size(), payload.len() as u64);
        match fr.content().unwrap() {
            FileContent::Just(x) => assert_eq!(x, payload),
            x => panic!("unexpected: {:?}", x),
        }
    }

    #[test]
    fn mismatching_blocksizes() {
        // one link, zero blocksizes
        let block = &[
            0x12, 0x08, 0x0a, 0x04, 0x01, 0x55, 0x12, 0x00, 0x18, 0x00, 0x0a, 0x04, 0x08, 0x02,
            0x18, 0x2a,
        ];
        let cid = dag_pb_cid(block);
        match FileReader::from_block(&cid, block) {
            Err(FileReadFailed::File(FileError::LinksAndBlocksizesMismatch)) => {}
            x => panic!("unexpected: {:?}", x.map(|_| ())),
        }
    }
}
