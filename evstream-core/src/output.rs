//! Event sinks and output format writers.
//!
//! Decoded events leave the pipeline through an [`EventSink`]. The crate
//! ships an in-memory sink (`Vec<Event>`) plus CSV and binary file writers.

use crate::types::{Event, Resolution};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Magic bytes opening a binary event file.
pub const BINARY_MAGIC: &[u8; 8] = b"EVSTBIN\0";
/// Binary event file format version.
pub const BINARY_VERSION: u32 = 1;
/// Bytes per event record in a binary event file.
pub const BINARY_RECORD_SIZE: usize = 16;

/// Errors that can occur during output writing.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Destination for decoded events.
///
/// `append_events` receives the events of one frame in decode order.
pub trait EventSink {
    fn append_events(&mut self, events: &[Event]) -> Result<(), OutputError>;

    fn flush(&mut self) -> Result<(), OutputError> {
        Ok(())
    }
}

impl EventSink for Vec<Event> {
    fn append_events(&mut self, events: &[Event]) -> Result<(), OutputError> {
        self.extend_from_slice(events);
        Ok(())
    }
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn append_events(&mut self, events: &[Event]) -> Result<(), OutputError> {
        (**self).append_events(events)
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        (**self).flush()
    }
}

/// Field ordering for CSV output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldOrder {
    /// x, y, p, t
    #[default]
    XYPT,
    /// t, x, y, p
    TXYP,
    /// x, y, t, p
    XYTP,
    /// Custom order, indices into `[x, y, p, t]`
    Custom([usize; 4]),
}

impl std::str::FromStr for FieldOrder {
    type Err = OutputError;

    /// Parses a field order from a list like "x,y,p,t" or "t,x,y,p".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<String> = s.split(',').map(|p| p.trim().to_lowercase()).collect();

        if parts.len() != 4 {
            return Err(OutputError::InvalidFormat(
                "Format must have exactly 4 fields: x, y, p, t".to_string(),
            ));
        }

        let mut indices = [0usize; 4];
        let mut used = [false; 4];

        for (slot, part) in parts.iter().enumerate() {
            let field = match part.as_str() {
                "x" => 0,
                "y" => 1,
                "p" | "pol" | "polarity" => 2,
                "t" | "ts" | "time" | "timestamp" => 3,
                _ => {
                    return Err(OutputError::InvalidFormat(format!(
                        "Unknown field: {}. Use x, y, p, t",
                        part
                    )))
                }
            };
            if used[field] {
                return Err(OutputError::InvalidFormat(format!(
                    "Duplicate field: {}",
                    part
                )));
            }
            indices[slot] = field;
            used[field] = true;
        }

        Ok(match indices {
            [0, 1, 2, 3] => Self::XYPT,
            [3, 0, 1, 2] => Self::TXYP,
            [0, 1, 3, 2] => Self::XYTP,
            other => Self::Custom(other),
        })
    }
}

impl FieldOrder {
    const NAMES: [&'static str; 4] = ["x", "y", "polarity", "timestamp"];

    /// Column indices into `[x, y, p, t]`.
    pub fn indices(&self) -> [usize; 4] {
        match self {
            Self::XYPT => [0, 1, 2, 3],
            Self::TXYP => [3, 0, 1, 2],
            Self::XYTP => [0, 1, 3, 2],
            Self::Custom(indices) => *indices,
        }
    }

    /// Column header line for this order, e.g. `x,y,polarity,timestamp`.
    pub fn header(&self) -> String {
        self.indices()
            .iter()
            .map(|&i| Self::NAMES[i])
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// CSV writer for events.
pub struct CsvWriter<W: Write> {
    writer: BufWriter<W>,
    field_order: FieldOrder,
}

impl<W: Write> CsvWriter<W> {
    pub fn new(writer: W, field_order: FieldOrder) -> Self {
        Self {
            writer: BufWriter::new(writer),
            field_order,
        }
    }

    /// Writes the optional `%geometry:W,H` line and the column header.
    pub fn write_header(&mut self, resolution: Option<Resolution>) -> Result<(), OutputError> {
        if let Some(res) = resolution {
            writeln!(self.writer, "%geometry:{},{}", res.width, res.height)?;
        }
        writeln!(self.writer, "{}", self.field_order.header())?;
        Ok(())
    }

    pub fn write_events(&mut self, events: &[Event]) -> Result<(), OutputError> {
        for event in events {
            self.write_event(event)?;
        }
        Ok(())
    }

    #[inline]
    fn write_event(&mut self, event: &Event) -> Result<(), OutputError> {
        let p = u8::from(event.polarity);
        match self.field_order {
            FieldOrder::XYPT => writeln!(
                self.writer,
                "{},{},{},{}",
                event.x, event.y, p, event.timestamp
            )?,
            FieldOrder::TXYP => writeln!(
                self.writer,
                "{},{},{},{}",
                event.timestamp, event.x, event.y, p
            )?,
            FieldOrder::XYTP => writeln!(
                self.writer,
                "{},{},{},{}",
                event.x, event.y, event.timestamp, p
            )?,
            FieldOrder::Custom(indices) => {
                let values = [event.x as u64, event.y as u64, p as u64, event.timestamp];
                writeln!(
                    self.writer,
                    "{},{},{},{}",
                    values[indices[0]], values[indices[1]], values[indices[2]], values[indices[3]]
                )?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

impl<W: Write> EventSink for CsvWriter<W> {
    fn append_events(&mut self, events: &[Event]) -> Result<(), OutputError> {
        self.write_events(events)
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        CsvWriter::flush(self)
    }
}

/// Binary writer for events.
///
/// Header (little-endian): magic `EVSTBIN\0`, version `u32`, width `u32`,
/// height `u32`. Each event record is 16 bytes:
/// - x: u16
/// - y: u16
/// - polarity: u8
/// - padding: 3 bytes
/// - timestamp: u64
///
/// The stream length is open-ended, so the header carries no event count.
pub struct BinaryWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> BinaryWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub fn write_header(&mut self, resolution: Resolution) -> Result<(), OutputError> {
        self.writer.write_all(BINARY_MAGIC)?;
        self.writer.write_u32::<LittleEndian>(BINARY_VERSION)?;
        self.writer.write_u32::<LittleEndian>(resolution.width)?;
        self.writer.write_u32::<LittleEndian>(resolution.height)?;
        Ok(())
    }

    pub fn write_events(&mut self, events: &[Event]) -> Result<(), OutputError> {
        for event in events {
            self.writer.write_u16::<LittleEndian>(event.x)?;
            self.writer.write_u16::<LittleEndian>(event.y)?;
            self.writer.write_all(&[u8::from(event.polarity), 0, 0, 0])?;
            self.writer.write_u64::<LittleEndian>(event.timestamp)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

impl<W: Write> EventSink for BinaryWriter<W> {
    fn append_events(&mut self, events: &[Event]) -> Result<(), OutputError> {
        self.write_events(events)
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        BinaryWriter::flush(self)
    }
}

/// Output file format, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Binary,
}

impl OutputFormat {
    /// Picks the format from a path's extension (`.csv` or `.bin`).
    pub fn from_path(path: &Path) -> Result<Self, OutputError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("csv")
            .to_lowercase();
        match ext.as_str() {
            "csv" => Ok(Self::Csv),
            "bin" => Ok(Self::Binary),
            other => Err(OutputError::InvalidFormat(format!(
                "Unsupported output format: .{}. Use .csv or .bin",
                other
            ))),
        }
    }
}

/// Creates `path` and returns a sink writing the format its extension
/// names, with the header already written.
pub fn create_file_sink<P: AsRef<Path>>(
    path: P,
    resolution: Resolution,
    field_order: FieldOrder,
) -> Result<Box<dyn EventSink>, OutputError> {
    let path = path.as_ref();
    let format = OutputFormat::from_path(path)?;
    let file = File::create(path)?;
    Ok(match format {
        OutputFormat::Csv => {
            let mut writer = CsvWriter::new(file, field_order);
            writer.write_header(Some(resolution))?;
            Box::new(writer)
        }
        OutputFormat::Binary => {
            let mut writer = BinaryWriter::new(file);
            writer.write_header(resolution)?;
            Box::new(writer)
        }
    })
}
