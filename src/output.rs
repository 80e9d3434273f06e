use std::io::{self, Write};

use serde::Serialize;

use crate::aggregate::Summary;
use crate::metadata::FetchReport;
use crate::monitor::RunStatus;
use crate::scheduler::RunReport;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_fetch(report: &FetchReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_summary(summary: &Summary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_status(status: &RunStatus) -> io::Result<()> {
        Self::print_json(status)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
