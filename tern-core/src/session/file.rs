//! File transfer sessions.
//!
//! After the hello on a file-kind link, a short negotiation runs over
//! framed packets tagged by their first byte: init (0x00) with file
//! count, total size and speed; init-ack (0x01); per-file header (0x02)
//! and resume position (0x03); stop (0x04); speed change (0x05); then
//! raw data chunks (0x06) written sequentially to the destination.
//! End of file is inferred when the received byte count reaches the
//! advertised size.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::TernError;
use crate::packet::Packet;
use crate::registry::LinkId;

/// Payload bytes per data packet; comfortably under the frame ceiling.
pub const FILE_CHUNK_SIZE: usize = 1024;

/// Default negotiated throughput, in the protocol's 1–100 scale.
pub const FILE_SPEED_FULL: u32 = 100;

// ── FilePacket ───────────────────────────────────────────────────

/// Every framed packet on a file link, tagged by its first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePacket {
    /// 0x00 — transfer negotiation from the sender.
    Init {
        count: u32,
        total_bytes: u32,
        speed: u32,
        nick: String,
    },
    /// 0x01 — receiver's answer.
    InitAck { speed: u32, nick: String },
    /// 0x02 — metadata for the next file.
    Header {
        filename: String,
        size: u32,
        speed: u32,
    },
    /// 0x03 — receiver's resume position for the announced file.
    Position { file_index: u32, offset: u32 },
    /// 0x04 — skip the current file.
    Stop { file_index: u32 },
    /// 0x05 — throughput change, either direction, any time.
    Speed { speed: u32 },
    /// 0x06 — sequential data.
    Data { bytes: Vec<u8> },
}

impl FilePacket {
    pub fn kind(&self) -> u8 {
        match self {
            FilePacket::Init { .. } => 0x00,
            FilePacket::InitAck { .. } => 0x01,
            FilePacket::Header { .. } => 0x02,
            FilePacket::Position { .. } => 0x03,
            FilePacket::Stop { .. } => 0x04,
            FilePacket::Speed { .. } => 0x05,
            FilePacket::Data { .. } => 0x06,
        }
    }

    pub fn build(&self) -> Result<Packet, TernError> {
        let mut p = Packet::new();
        p.append_u8(self.kind())?;
        match self {
            FilePacket::Init {
                count,
                total_bytes,
                speed,
                nick,
            } => {
                p.append_u32(*count)?;
                p.append_u32(*total_bytes)?;
                p.append_u32(*speed)?;
                p.append_string(nick)?;
            }
            FilePacket::InitAck { speed, nick } => {
                p.append_u32(*speed)?;
                p.append_string(nick)?;
            }
            FilePacket::Header {
                filename,
                size,
                speed,
            } => {
                p.append_string(filename)?;
                p.append_u32(*size)?;
                p.append_u32(*speed)?;
            }
            FilePacket::Position { file_index, offset } => {
                p.append_u32(*file_index)?;
                p.append_u32(*offset)?;
            }
            FilePacket::Stop { file_index } => {
                p.append_u32(*file_index)?;
            }
            FilePacket::Speed { speed } => {
                p.append_u32(*speed)?;
            }
            FilePacket::Data { bytes } => {
                p.append_bytes(bytes)?;
            }
        }
        Ok(p)
    }

    pub fn parse(p: &mut Packet) -> Result<Self, TernError> {
        p.goto(0)?;
        let kind = p.read_u8()?;
        Ok(match kind {
            0x00 => FilePacket::Init {
                count: p.read_u32()?,
                total_bytes: p.read_u32()?,
                speed: p.read_u32()?,
                nick: p.read_string()?,
            },
            0x01 => FilePacket::InitAck {
                speed: p.read_u32()?,
                nick: p.read_string()?,
            },
            0x02 => FilePacket::Header {
                filename: p.read_string()?,
                size: p.read_u32()?,
                speed: p.read_u32()?,
            },
            0x03 => FilePacket::Position {
                file_index: p.read_u32()?,
                offset: p.read_u32()?,
            },
            0x04 => FilePacket::Stop {
                file_index: p.read_u32()?,
            },
            0x05 => FilePacket::Speed {
                speed: p.read_u32()?,
            },
            0x06 => FilePacket::Data {
                bytes: p.tail().to_vec(),
            },
            other => {
                return Err(TernError::UnknownVariant {
                    type_name: "FilePacket",
                    value: other as u32,
                });
            }
        })
    }
}

// ── Sinks and sources ────────────────────────────────────────────

/// Where inbound file data goes. The disk variant appends strictly
/// sequentially; the memory variant keeps transfers testable without
/// touching the filesystem.
#[derive(Debug)]
pub enum FileSink {
    Memory(Vec<u8>),
    Disk(tokio::fs::File),
}

impl FileSink {
    pub async fn create(dir: &Path, filename: &str) -> Result<Self, TernError> {
        // strip any path the peer smuggled into the name
        let safe_name = Path::new(filename)
            .file_name()
            .ok_or(TernError::Malformed("empty filename"))?;
        let file = tokio::fs::File::create(dir.join(safe_name)).await?;
        Ok(FileSink::Disk(file))
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TernError> {
        match self {
            FileSink::Memory(buf) => {
                buf.extend_from_slice(bytes);
                Ok(())
            }
            FileSink::Disk(file) => Ok(file.write_all(bytes).await?),
        }
    }
}

/// Where outbound file data comes from.
#[derive(Debug)]
pub enum FileSource {
    Memory { data: Vec<u8>, pos: usize },
    Disk(tokio::fs::File),
}

impl FileSource {
    pub async fn open(path: &Path) -> Result<(Self, u64), TernError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok((FileSource::Disk(file), size))
    }

    pub async fn seek(&mut self, offset: u64) -> Result<(), TernError> {
        match self {
            FileSource::Memory { pos, data } => {
                *pos = (offset as usize).min(data.len());
                Ok(())
            }
            FileSource::Disk(file) => {
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                Ok(())
            }
        }
    }

    /// Next sequential chunk; empty when the file is exhausted.
    pub async fn read_chunk(&mut self) -> Result<Vec<u8>, TernError> {
        match self {
            FileSource::Memory { data, pos } => {
                let end = (*pos + FILE_CHUNK_SIZE).min(data.len());
                let chunk = data[*pos..end].to_vec();
                *pos = end;
                Ok(chunk)
            }
            FileSource::Disk(file) => {
                let mut buf = vec![0u8; FILE_CHUNK_SIZE];
                let n = file.read(&mut buf).await?;
                buf.truncate(n);
                Ok(buf)
            }
        }
    }
}

// ── FileSession ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Sending,
    Receiving,
}

/// Lifecycle of a file session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Accepter: listening for the sender's connection.
    Listening,
    /// Sender: dialing the accepter's advertised port.
    Connecting,
    /// Link up; init/init-ack outstanding.
    Initializing,
    /// Between files: header/position outstanding.
    NextFile,
    /// Data flowing.
    Transferring,
    /// Every file completed.
    Done,
}

/// State for one file transfer, either direction.
#[derive(Debug)]
pub struct FileSession {
    pub remote_uin: u32,
    /// Correlation id of the originating file request.
    pub seq: u32,
    pub link: Option<LinkId>,
    pub direction: TransferDirection,
    pub status: FileStatus,
    pub remote_handle: String,
    pub speed: u32,

    /// Sender side: the queue of paths to transfer.
    pub files: Vec<PathBuf>,
    pub current_index: u32,
    pub total_files: u32,
    pub total_bytes: u64,
    pub transferred: u64,

    pub current_file: String,
    pub current_size: u64,
    pub current_progress: u64,

    pub sink: Option<FileSink>,
    pub source: Option<FileSource>,
}

impl FileSession {
    /// Sender-side session, created when the peer accepts our offer.
    pub fn outgoing(remote_uin: u32, seq: u32, files: Vec<PathBuf>) -> Self {
        Self {
            remote_uin,
            seq,
            link: None,
            direction: TransferDirection::Sending,
            status: FileStatus::Connecting,
            remote_handle: String::new(),
            speed: FILE_SPEED_FULL,
            total_files: files.len() as u32,
            files,
            current_index: 0,
            total_bytes: 0,
            transferred: 0,
            current_file: String::new(),
            current_size: 0,
            current_progress: 0,
            sink: None,
            source: None,
        }
    }

    /// Receiver-side session, created when the caller accepts an offer.
    pub fn listening(remote_uin: u32, seq: u32, filename: String, size: u32) -> Self {
        Self {
            remote_uin,
            seq,
            link: None,
            direction: TransferDirection::Receiving,
            status: FileStatus::Listening,
            remote_handle: String::new(),
            speed: FILE_SPEED_FULL,
            files: Vec::new(),
            current_index: 0,
            total_files: 1,
            total_bytes: size as u64,
            transferred: 0,
            current_file: filename,
            current_size: 0,
            current_progress: 0,
            sink: None,
            source: None,
        }
    }

    /// Receiver: record an announced file and answer with our resume
    /// position.
    pub fn begin_file(&mut self, filename: String, size: u32) -> FilePacket {
        self.current_file = filename;
        self.current_size = size as u64;
        self.current_progress = 0;
        self.status = FileStatus::Transferring;
        FilePacket::Position {
            file_index: self.current_index,
            offset: 0,
        }
    }

    /// Receiver: append one data chunk. Returns `true` when the current
    /// file is complete.
    pub async fn write_chunk(&mut self, bytes: &[u8]) -> Result<bool, TernError> {
        let sink = self
            .sink
            .as_mut()
            .ok_or(TernError::InvalidTransition("data before file header"))?;
        sink.write(bytes).await?;
        self.current_progress += bytes.len() as u64;
        self.transferred += bytes.len() as u64;
        if self.current_progress >= self.current_size {
            self.current_index += 1;
            self.status = if self.current_index >= self.total_files {
                FileStatus::Done
            } else {
                FileStatus::NextFile
            };
            self.sink = None;
            return Ok(true);
        }
        Ok(false)
    }

    /// Sender: the header packet for the current file, or `None` when
    /// every file has been sent.
    pub fn current_header(&self) -> Option<FilePacket> {
        let path = self.files.get(self.current_index as usize)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Some(FilePacket::Header {
            filename,
            size: self.current_size as u32,
            speed: self.speed,
        })
    }

    /// Sender: read the next chunk. An empty chunk means the current
    /// file is exhausted.
    pub async fn read_chunk(&mut self) -> Result<Vec<u8>, TernError> {
        let source = self
            .source
            .as_mut()
            .ok_or(TernError::InvalidTransition("no file open for sending"))?;
        let chunk = source.read_chunk().await?;
        self.current_progress += chunk.len() as u64;
        self.transferred += chunk.len() as u64;
        Ok(chunk)
    }

    /// Sender: advance past the current file. Returns `true` when more
    /// files remain.
    pub fn advance_file(&mut self) -> bool {
        self.source = None;
        self.current_index += 1;
        self.current_progress = 0;
        if (self.current_index as usize) < self.files.len() {
            self.status = FileStatus::NextFile;
            true
        } else {
            self.status = FileStatus::Done;
            false
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_packets_roundtrip() {
        let packets = [
            FilePacket::Init {
                count: 2,
                total_bytes: 4096,
                speed: FILE_SPEED_FULL,
                nick: "ariel".into(),
            },
            FilePacket::InitAck {
                speed: 50,
                nick: "peer".into(),
            },
            FilePacket::Header {
                filename: "notes.txt".into(),
                size: 2048,
                speed: 100,
            },
            FilePacket::Position {
                file_index: 1,
                offset: 512,
            },
            FilePacket::Stop { file_index: 0 },
            FilePacket::Speed { speed: 25 },
            FilePacket::Data {
                bytes: vec![1, 2, 3, 4, 5],
            },
        ];
        for packet in packets {
            let mut p = packet.build().unwrap();
            assert_eq!(FilePacket::parse(&mut p).unwrap(), packet, "{packet:?}");
        }
    }

    #[test]
    fn unknown_file_packet_kind_is_rejected() {
        let mut p = Packet::from_bytes(&[0x1F, 0, 0, 0, 0]).unwrap();
        assert!(matches!(
            FilePacket::parse(&mut p),
            Err(TernError::UnknownVariant { .. })
        ));
    }

    #[tokio::test]
    async fn receiver_completes_on_advertised_size() {
        let mut s = FileSession::listening(42, 7, "blob.bin".into(), 10);
        let pos = s.begin_file("blob.bin".into(), 10);
        assert_eq!(
            pos,
            FilePacket::Position {
                file_index: 0,
                offset: 0
            }
        );
        s.sink = Some(FileSink::Memory(Vec::new()));

        assert!(!s.write_chunk(&[0u8; 6]).await.unwrap());
        assert_eq!(s.status, FileStatus::Transferring);
        assert!(s.write_chunk(&[0u8; 4]).await.unwrap());
        assert_eq!(s.status, FileStatus::Done);
        assert_eq!(s.transferred, 10);
        assert!(s.sink.is_none());
    }

    #[tokio::test]
    async fn data_before_header_is_an_error() {
        let mut s = FileSession::listening(42, 7, "x".into(), 10);
        assert!(s.write_chunk(&[1, 2, 3]).await.is_err());
    }

    #[tokio::test]
    async fn sender_chunks_and_advances() {
        let mut s = FileSession::outgoing(42, 7, vec![PathBuf::from("a.bin")]);
        s.current_size = 2500;
        s.source = Some(FileSource::Memory {
            data: vec![0xAB; 2500],
            pos: 0,
        });
        s.status = FileStatus::Transferring;

        let mut chunks = Vec::new();
        loop {
            let chunk = s.read_chunk().await.unwrap();
            if chunk.is_empty() {
                break;
            }
            chunks.push(chunk.len());
        }
        assert_eq!(chunks, vec![1024, 1024, 452]);
        assert_eq!(s.current_progress, 2500);

        assert!(!s.advance_file());
        assert_eq!(s.status, FileStatus::Done);
    }

    #[tokio::test]
    async fn source_seek_resumes_mid_file() {
        let mut src = FileSource::Memory {
            data: (0..100u8).collect(),
            pos: 0,
        };
        src.seek(90).await.unwrap();
        let chunk = src.read_chunk().await.unwrap();
        assert_eq!(chunk, (90..100u8).collect::<Vec<_>>());
    }

    #[test]
    fn sender_header_names_current_file() {
        let mut s = FileSession::outgoing(
            1,
            2,
            vec![PathBuf::from("/tmp/dir/report.pdf"), PathBuf::from("b.txt")],
        );
        s.current_size = 77;
        match s.current_header().unwrap() {
            FilePacket::Header { filename, size, .. } => {
                assert_eq!(filename, "report.pdf");
                assert_eq!(size, 77);
            }
            other => panic!("expected header, got {other:?}"),
        }
    }
}
