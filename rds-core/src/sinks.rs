//! Dump files
//!
//! One record per trace is appended to each file:
//!
//! | file                        | content                                    |
//! |-----------------------------|--------------------------------------------|
//! | `keys.bin`                  | 16 bytes                                   |
//! | `plaintexts.bin`            | 16 bytes                                   |
//! | `ciphertexts.bin`           | 16 bytes                                   |
//! | `masks.bin`                 | 16 bytes per mask, only with masks         |
//! | `sensor_traces_<N>k.csv`    | sample weights, one row per trace          |
//! | `traces_encoded.bin`        | sample weights, one byte each              |
//! | `traces_raw.bin`            | raw sample bytes                           |
//! | `temperature_<N>k.csv`      | auxiliary words in degrees Celsius         |

use crate::decoder::xadc_celsius;
use crate::session::TraceRecord;
use crate::thermometer::{CalibrationLayout, CalibrationWord};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Destination for captured traces
pub trait TraceSink {
    /// Append one trace; returns the number of bytes written
    fn append(&mut self, record: &TraceRecord) -> Result<usize>;

    fn flush(&mut self) -> Result<()>;
}

impl<S: TraceSink + ?Sized> TraceSink for Box<S> {
    fn append(&mut self, record: &TraceRecord) -> Result<usize> {
        (**self).append(record)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Encoding of the sensor trace dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TraceFormat {
    /// Comma-separated weights, one row per trace
    #[default]
    Csv,
    /// Binary weights, one byte per sample
    Weights,
    /// Raw sample bytes
    Raw,
}

#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub dir: PathBuf,
    /// Used to name the CSV files
    pub num_traces: u64,
    pub mask_count: usize,
    pub format: TraceFormat,
    /// Also write the auxiliary signal as temperatures
    pub dump_signal: bool,
    /// Bits per sample; the weights file only holds widths up to 255
    pub sensor_width: u32,
}

/// Buffered dump files in one directory
pub struct FileSinks {
    keys: BufWriter<File>,
    plaintexts: BufWriter<File>,
    ciphertexts: BufWriter<File>,
    masks: Option<BufWriter<File>>,
    traces: BufWriter<File>,
    temperature: Option<BufWriter<File>>,
    format: TraceFormat,
    records: u64,
}

fn create(dir: &Path, name: &str) -> Result<BufWriter<File>> {
    let path = dir.join(name);
    let file = File::create(&path)?;
    debug!("Opened dump file {}", path.display());
    Ok(BufWriter::new(file))
}

impl FileSinks {
    pub fn create(options: &SinkOptions) -> Result<Self> {
        if options.format == TraceFormat::Weights && options.sensor_width > u8::MAX as u32 {
            return Err(Error::Config(format!(
                "weights dump stores one byte per sample, sensor width {} does not fit",
                options.sensor_width
            )));
        }
        fs::create_dir_all(&options.dir)?;
        let dir = options.dir.as_path();
        let thousands = options.num_traces / 1000;

        let masks = if options.mask_count > 0 {
            Some(create(dir, "masks.bin")?)
        } else {
            None
        };
        let traces = match options.format {
            TraceFormat::Csv => create(dir, &format!("sensor_traces_{}k.csv", thousands))?,
            TraceFormat::Weights => create(dir, "traces_encoded.bin")?,
            TraceFormat::Raw => create(dir, "traces_raw.bin")?,
        };
        let temperature = if options.dump_signal {
            Some(create(dir, &format!("temperature_{}k.csv", thousands))?)
        } else {
            None
        };

        Ok(Self {
            keys: create(dir, "keys.bin")?,
            plaintexts: create(dir, "plaintexts.bin")?,
            ciphertexts: create(dir, "ciphertexts.bin")?,
            masks,
            traces,
            temperature,
            format: options.format,
            records: 0,
        })
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    fn trace_bytes(&self, record: &TraceRecord) -> Vec<u8> {
        match self.format {
            TraceFormat::Csv => {
                let row: Vec<String> = record.trace.weights().iter().map(|w| w.to_string()).collect();
                let mut line = row.join(",");
                line.push('\n');
                line.into_bytes()
            }
            TraceFormat::Weights => record.trace.weights().iter().map(|&w| w.min(u8::MAX as u32) as u8).collect(),
            TraceFormat::Raw => record.trace.as_bytes().to_vec(),
        }
    }
}

impl TraceSink for FileSinks {
    fn append(&mut self, record: &TraceRecord) -> Result<usize> {
        let mut written = 0;

        self.keys.write_all(&record.key)?;
        self.plaintexts.write_all(&record.plaintext)?;
        self.ciphertexts.write_all(&record.cipher)?;
        written += 48;

        if let Some(masks) = self.masks.as_mut() {
            for mask in &record.masks {
                masks.write_all(mask)?;
                written += mask.len();
            }
        }

        let trace = self.trace_bytes(record);
        self.traces.write_all(&trace)?;
        written += trace.len();

        if let Some(temperature) = self.temperature.as_mut() {
            let row: Vec<String> = record.trace.aux().iter().map(|&raw| format!("{:.6}", xadc_celsius(raw))).collect();
            let mut line = row.join(",");
            line.push('\n');
            temperature.write_all(line.as_bytes())?;
            written += line.len();
        }

        self.records += 1;
        Ok(written)
    }

    fn flush(&mut self) -> Result<()> {
        self.keys.flush()?;
        self.plaintexts.flush()?;
        self.ciphertexts.flush()?;
        if let Some(masks) = self.masks.as_mut() {
            masks.flush()?;
        }
        self.traces.flush()?;
        if let Some(temperature) = self.temperature.as_mut() {
            temperature.flush()?;
        }
        Ok(())
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<TraceRecord>,
    pub flushes: usize,
}

impl TraceSink for MemorySink {
    fn append(&mut self, record: &TraceRecord) -> Result<usize> {
        self.records.push(record.clone());
        Ok(48 + record.trace.as_bytes().len())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

/// Store one calibration word per sensor, back to back
pub fn write_calibration_file(path: &Path, words: &[CalibrationWord]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for word in words {
        out.write_all(word.as_bytes())?;
    }
    out.flush()?;
    Ok(())
}

/// Load the words stored by [`write_calibration_file`]
pub fn read_calibration_file(path: &Path, layout: CalibrationLayout) -> Result<Vec<CalibrationWord>> {
    layout.validate()?;
    let bytes = fs::read(path)?;
    let size = layout.word_bytes();
    if bytes.is_empty() || bytes.len() % size != 0 {
        return Err(Error::Config(format!(
            "calibration file {} has {} bytes, expected a non-zero multiple of {}",
            path.display(),
            bytes.len(),
            size
        )));
    }
    bytes
        .chunks_exact(size)
        .map(|chunk| CalibrationWord::from_bytes(chunk.to_vec(), layout))
        .collect()
}

/// Write a value as pretty-printed JSON
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Trace;
    use crate::session::PlaintextSource;
    use crate::thermometer::{pack_calibration_word, DelayTap};

    fn record(index: u64, masks: usize) -> TraceRecord {
        TraceRecord {
            index,
            key: [index as u8; 16],
            masks: vec![[0xAA; 16]; masks],
            plaintext: [1; 16],
            cipher: [2; 16],
            trace: Trace::new(vec![0xFF, 0x00, 0x0F, 0x01], 2).with_aux(vec![2500, 0]),
            source: PlaintextSource::Constant,
        }
    }

    fn options(dir: &Path, format: TraceFormat, masks: usize) -> SinkOptions {
        SinkOptions {
            dir: dir.to_path_buf(),
            num_traces: 3000,
            mask_count: masks,
            format,
            dump_signal: true,
            sensor_width: 16,
        }
    }

    #[test]
    fn test_csv_dump() {
        let dir = tempfile::tempdir().unwrap();
        let mut sinks = FileSinks::create(&options(dir.path(), TraceFormat::Csv, 0)).unwrap();
        sinks.append(&record(0, 0)).unwrap();
        sinks.append(&record(1, 0)).unwrap();
        sinks.flush().unwrap();

        let csv = fs::read_to_string(dir.path().join("sensor_traces_3k.csv")).unwrap();
        assert_eq!(csv, "8,5\n8,5\n");
        assert_eq!(fs::read(dir.path().join("keys.bin")).unwrap().len(), 32);
        assert!(!dir.path().join("masks.bin").exists());

        let temps = fs::read_to_string(dir.path().join("temperature_3k.csv")).unwrap();
        assert!(temps.starts_with("34.45"));
        assert!(temps.lines().next().unwrap().ends_with(",-273.150000"));
    }

    #[test]
    fn test_masks_and_weights() {
        let dir = tempfile::tempdir().unwrap();
        let mut sinks = FileSinks::create(&options(dir.path(), TraceFormat::Weights, 2)).unwrap();
        let written = sinks.append(&record(0, 2)).unwrap();
        sinks.flush().unwrap();

        assert_eq!(fs::read(dir.path().join("masks.bin")).unwrap(), vec![0xAA; 32]);
        assert_eq!(fs::read(dir.path().join("traces_encoded.bin")).unwrap(), vec![8, 5]);
        assert!(written >= 48 + 32 + 2);
    }

    #[test]
    fn test_weights_dump_rejects_wide_sensors() {
        let dir = tempfile::tempdir().unwrap();
        let mut wide = options(dir.path(), TraceFormat::Weights, 0);
        wide.sensor_width = 512;
        assert!(matches!(FileSinks::create(&wide), Err(Error::Config(_))));
        assert!(!dir.path().join("traces_encoded.bin").exists());

        // raw bytes carry any width
        wide.format = TraceFormat::Raw;
        assert!(FileSinks::create(&wide).is_ok());
    }

    #[test]
    fn test_raw_dump() {
        let dir = tempfile::tempdir().unwrap();
        let mut sinks = FileSinks::create(&options(dir.path(), TraceFormat::Raw, 0)).unwrap();
        sinks.append(&record(0, 0)).unwrap();
        sinks.flush().unwrap();
        assert_eq!(
            fs::read(dir.path().join("traces_raw.bin")).unwrap(),
            vec![0xFF, 0x00, 0x0F, 0x01]
        );
    }

    #[test]
    fn test_calibration_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idc_idf.bin");
        let layout = CalibrationLayout::default();
        let words = vec![
            pack_calibration_word(DelayTap::new(9, 3), layout).unwrap(),
            pack_calibration_word(DelayTap::new(4, 0), layout).unwrap(),
        ];
        write_calibration_file(&path, &words).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 32);

        let loaded = read_calibration_file(&path, layout).unwrap();
        assert_eq!(loaded[0].tap(), DelayTap::new(9, 3));
        assert_eq!(loaded[1].tap(), DelayTap::new(4, 0));

        fs::write(&path, [0u8; 20]).unwrap();
        assert!(matches!(read_calibration_file(&path, layout), Err(Error::Config(_))));
    }
}
