//! Per-session CSV output: one row per `<EventName>_START`/`_END` pair (plus
//! the synthetic `PLAYBACK_*`/`PLAYER_SESSION_CREATE` markers), flushed after
//! every write so the file can be tailed while a run is in progress.

use std::io::Write;
use std::path::{Path, PathBuf};

use core::error::ShinyError;

pub struct SessionWriter {
    writer: csv::Writer<std::fs::File>,
    session_id: u64,
    worker_id: usize,
    iteration: u64,
}

impl SessionWriter {
    /// Creates `<output_dir>/sessions/<session_id>_<worker_id>_<iteration>.csv`,
    /// writing the two header comment lines (raw argv, then the JSON args
    /// snapshot) before handing the file to the CSV writer.
    pub fn create(
        output_dir: &Path,
        session_id: u64,
        worker_id: usize,
        iteration: u64,
        argv_comment: &str,
        args_json_comment: &str,
    ) -> Result<Self, ShinyError> {
        let sessions_dir = output_dir.join("sessions");
        std::fs::create_dir_all(&sessions_dir)?;

        let path: PathBuf =
            sessions_dir.join(format!("{session_id}_{worker_id}_{iteration}.csv"));
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "# {argv_comment}")?;
        writeln!(file, "# {args_json_comment}")?;

        let mut writer = csv::WriterBuilder::new().from_writer(file);
        writer
            .write_record([
                "session_id",
                "worker_id",
                "iteration",
                "event",
                "timestamp",
                "input_line_number",
                "comment",
            ])
            .map_err(csv_err)?;
        writer.flush()?;

        Ok(Self {
            writer,
            session_id,
            worker_id,
            iteration,
        })
    }

    pub fn record(
        &mut self,
        event: &str,
        timestamp_ms: i64,
        input_line_number: Option<usize>,
        comment: &str,
    ) -> Result<(), ShinyError> {
        self.writer
            .write_record([
                self.session_id.to_string(),
                self.worker_id.to_string(),
                self.iteration.to_string(),
                event.to_string(),
                timestamp_ms.to_string(),
                input_line_number
                    .map(|n| n.to_string())
                    .unwrap_or_default(),
                comment.to_string(),
            ])
            .map_err(csv_err)?;
        self.writer.flush()?;
        Ok(())
    }
}

fn csv_err(e: csv::Error) -> ShinyError {
    ShinyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}
