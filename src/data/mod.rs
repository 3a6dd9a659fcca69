//! Persistence of sweep records, traces and temperature logs.

pub mod storage;

pub use storage::{
    read_trace_csv, write_trace_csv, CsvRecordWriter, MemorySink, RecordSink,
    TemperatureLogWriter,
};
