use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::classifier::{BucketedRecord, Columns, HeaderIndex, RowOutcome, SkipReason, MIN_ROW_LEN};
use crate::error::{ExportError, Result};
use crate::sink::{AppendStatus, BucketSink, BucketSummary, Clock};
use crate::workbook::{find_spreadsheet, read_first_sheet};

/// Directory, under the working directory, where processed spreadsheets are moved
pub const PROCESSED_DIR: &str = "processed";

/// What to do with a row whose amount cannot be parsed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AmountPolicy {
    /// Stop the whole run
    #[default]
    Abort,
    /// Log the row and carry on with the next one
    Skip,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub rows_read: usize,
    pub records_written: usize,
    pub skipped_short: usize,
    pub skipped_channel: usize,
    pub skipped_amount: usize,
    pub write_failures: usize,
    pub buckets: Vec<BucketSummary>,
    pub archived_to: PathBuf,
}

/// Splits the spreadsheet found in a working directory into per payment method CSV files, then
/// moves it to the [`PROCESSED_DIR`] directory
pub struct Exporter {
    base_dir: PathBuf,
    amount_policy: AmountPolicy,
    print_rows: bool,
    clock: Option<Clock>,
}

impl Exporter {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            amount_policy: AmountPolicy::default(),
            print_rows: false,
            clock: None,
        }
    }

    pub fn amount_policy(mut self, amount_policy: AmountPolicy) -> Self {
        self.amount_policy = amount_policy;
        self
    }

    pub fn print_rows(mut self, print_rows: bool) -> Self {
        self.print_rows = print_rows;
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn run(&self) -> Result<RunReport> {
        let input = find_spreadsheet(&self.base_dir)?;
        info!("Processing {input:?}");
        let rows = read_first_sheet(&input)?;
        self.export(&input, &rows)
    }

    /// Writes the bucket files for `rows`, the first of which is the header, then archives
    /// `input`. The input is only moved once every bucket file is flushed and closed.
    pub fn export<S: AsRef<str>>(&self, input: &Path, rows: &[Vec<S>]) -> Result<RunReport> {
        let Some((header, data)) = rows.split_first() else {
            return Err(ExportError::SheetRead {
                path: input.to_owned(),
                message: "the sheet contains no data".to_owned(),
            });
        };
        let columns = HeaderIndex::from_header(header).resolve()?;

        let processed_dir = self.base_dir.join(PROCESSED_DIR);
        fs::create_dir_all(&processed_dir).map_err(|source| ExportError::ProcessedDir {
            path: processed_dir.clone(),
            source,
        })?;

        let mut sink = match self.clock {
            Some(clock) => BucketSink::with_clock(&self.base_dir, clock),
            None => BucketSink::new(&self.base_dir),
        };
        let mut report = RunReport::default();
        let processed = self.process(&columns, data, &mut sink, &mut report);
        debug!("Closing {} bucket files", sink.bucket_count());
        report.buckets = sink.finalize();
        processed?;
        report.records_written = report.buckets.iter().map(|b| b.written).sum();
        report.write_failures = report.buckets.iter().map(|b| b.lost).sum();

        report.archived_to = archive(input, &processed_dir)?;
        Ok(report)
    }

    fn process<S: AsRef<str>>(
        &self,
        columns: &Columns,
        data: &[Vec<S>],
        sink: &mut BucketSink,
        report: &mut RunReport,
    ) -> Result<()> {
        // Data starts on the second spreadsheet row
        for (row_number, row) in (2..).zip(data) {
            if self.print_rows {
                let cells: Vec<&str> = row.iter().map(AsRef::as_ref).collect();
                println!("{}", cells.join(" | "));
            }
            report.rows_read += 1;
            match columns.classify(row_number, row) {
                Ok(RowOutcome::Record(BucketedRecord { bucket, record })) => {
                    if sink.append(&bucket, &record)? == AppendStatus::Lost {
                        debug!("Row {row_number} was not written");
                    }
                }
                Ok(RowOutcome::Skip(SkipReason::ShortRow)) => {
                    debug!("Skipping row {row_number}: fewer than {MIN_ROW_LEN} cells");
                    report.skipped_short += 1;
                }
                Ok(RowOutcome::Skip(SkipReason::NotRemotePayment)) => {
                    debug!("Skipping row {row_number}: not a remote payment");
                    report.skipped_channel += 1;
                }
                Err(err @ ExportError::AmountParse { .. })
                    if self.amount_policy == AmountPolicy::Skip =>
                {
                    warn!("Skipping row: {err}");
                    report.skipped_amount += 1;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Moves `input` into `processed_dir`, refusing to replace a file already there
fn archive(input: &Path, processed_dir: &Path) -> Result<PathBuf> {
    let file_name = input.file_name().ok_or_else(|| ExportError::Archival {
        from: input.to_owned(),
        to: processed_dir.to_owned(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "the input has no file name"),
    })?;
    let destination = processed_dir.join(file_name);
    let archival_error = |source: io::Error| ExportError::Archival {
        from: input.to_owned(),
        to: destination.clone(),
        source,
    };
    if destination.exists() {
        return Err(archival_error(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "a file with that name was already processed",
        )));
    }
    fs::rename(input, &destination).map_err(archival_error)?;
    info!("Moved {input:?} to {destination:?}");
    Ok(destination)
}

#[cfg(test)]
mod test {
    use chrono::{NaiveDate, NaiveDateTime};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::classifier::{PaymentBucket, REMOTE_PAYMENT_MARKER};
    use crate::sink::UTF8_BOM;

    const HEADER: [&str; 8] = [
        "№",
        "Дата операции",
        "Номер операции",
        "Канал оплаты",
        "Способ оплаты",
        "Детали покупки",
        "Сумма операции",
        "Статус",
    ];

    fn fixed_clock() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 31)
            .and_then(|date| date.and_hms_opt(23, 59, 0))
            .expect("valid date")
    }

    fn data_row<'a>(channel: &'a str, method: &'a str, details: &'a str, amount: &'a str) -> Vec<&'a str> {
        vec![
            "1",
            "31.01.2024",
            "OP-77",
            channel,
            method,
            details,
            amount,
            "Выполнено",
        ]
    }

    fn setup(rows: Vec<Vec<&str>>) -> (TempDir, PathBuf, Vec<Vec<&str>>) {
        let dir = TempDir::new().expect("tempdir");
        let input = dir.path().join("export.xlsx");
        fs::write(&input, "workbook").expect("input");
        let mut all_rows = vec![HEADER.to_vec()];
        all_rows.extend(rows);
        (dir, input, all_rows)
    }

    fn exporter(dir: &TempDir) -> Exporter {
        Exporter::new(dir.path()).clock(fixed_clock)
    }

    fn bucket_dirs(dir: &Path) -> Vec<String> {
        let mut dirs: Vec<String> = fs::read_dir(dir)
            .expect("dir")
            .map(|entry| entry.expect("entry"))
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name != PROCESSED_DIR)
            .collect();
        dirs.sort();
        dirs
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .expect("dir")
            .map(|entry| entry.expect("entry").path())
            .collect()
    }

    #[test]
    fn should_split_rows_by_payment_method_and_archive_the_input() {
        let (dir, input, rows) = setup(vec![
            data_row(REMOTE_PAYMENT_MARKER, "Kaspi Red", "Order 1001", "5 000"),
            data_row(REMOTE_PAYMENT_MARKER, "Kaspi Pay Account", "Order 1002", "1 234,56"),
        ]);

        let report = exporter(&dir).export(&input, &rows).expect("report");

        assert_eq!(vec!["Kaspi Gold", "Kaspi Red"], bucket_dirs(dir.path()));
        for (bucket, line) in [
            ("Kaspi Red", "1001,31.01.2024,5000,OP-77,Kaspi Red\n"),
            ("Kaspi Gold", "1002,31.01.2024,1235,OP-77,Kaspi Pay Account\n"),
        ] {
            let files = files_in(&dir.path().join(bucket));
            assert_eq!(1, files.len());
            assert_eq!(
                dir.path()
                    .join(bucket)
                    .join(format!("{bucket}_2024.01.31_23-59-00.csv")),
                files[0]
            );
            let content = fs::read(&files[0]).expect("bucket file");
            assert_eq!(&UTF8_BOM, &content[..3]);
            assert_eq!(line, std::str::from_utf8(&content[3..]).expect("utf-8"));
        }

        let archived = dir.path().join(PROCESSED_DIR).join("export.xlsx");
        assert!(!input.exists());
        assert!(archived.exists());
        assert_eq!(archived, report.archived_to);
        assert_eq!(2, report.rows_read);
        assert_eq!(2, report.records_written);
        assert_eq!(
            vec![PaymentBucket::KaspiRed, PaymentBucket::KaspiGold],
            report
                .buckets
                .iter()
                .map(|summary| summary.bucket.clone())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn should_write_kaspi_gold_rows_to_a_single_file_whatever_their_label() {
        let (dir, input, rows) = setup(vec![
            data_row(REMOTE_PAYMENT_MARKER, "Счет в Kaspi Pay", "Order 5", "50"),
            data_row(REMOTE_PAYMENT_MARKER, "Kaspi Gold", "Order 6", "60"),
        ]);

        let report = exporter(&dir).export(&input, &rows).expect("report");

        assert_eq!(vec!["Kaspi Gold"], bucket_dirs(dir.path()));
        let files = files_in(&dir.path().join("Kaspi Gold"));
        assert_eq!(1, files.len());
        assert_eq!(
            "\u{feff}5,31.01.2024,50,OP-77,Счет в Kaspi Pay\n6,31.01.2024,60,OP-77,Kaspi Gold\n",
            fs::read_to_string(&files[0]).expect("bucket file")
        );
        assert_eq!(2, report.records_written);
        assert!(!input.exists());
    }

    #[test]
    fn should_fail_before_writing_anything_when_the_processed_directory_cannot_be_created() {
        let (dir, input, rows) = setup(vec![data_row(
            REMOTE_PAYMENT_MARKER,
            "Kaspi Red",
            "Order 1",
            "10",
        )]);
        fs::write(dir.path().join(PROCESSED_DIR), "not a directory").expect("file");

        let err = exporter(&dir)
            .export(&input, &rows)
            .expect_err("processed directory");

        assert!(matches!(err, ExportError::ProcessedDir { .. }));
        assert!(bucket_dirs(dir.path()).is_empty());
        assert!(input.exists());
    }

    #[test]
    fn should_count_skipped_rows() {
        let (dir, input, rows) = setup(vec![
            data_row("Kaspi QR", "Kaspi Red", "Order 1", "10"),
            vec![REMOTE_PAYMENT_MARKER, "Kaspi Red"],
            data_row(REMOTE_PAYMENT_MARKER, "Kaspi Kredit", "Order 2", "10"),
            data_row(REMOTE_PAYMENT_MARKER, "Кредит на Покупки", "Order 3", "20"),
        ]);

        let report = exporter(&dir).export(&input, &rows).expect("report");

        assert_eq!(4, report.rows_read);
        assert_eq!(1, report.skipped_channel);
        assert_eq!(1, report.skipped_short);
        assert_eq!(2, report.records_written);
        assert_eq!(vec!["Kaspi Red"], bucket_dirs(dir.path()));
        let files = files_in(&dir.path().join("Kaspi Red"));
        let content = fs::read_to_string(&files[0]).expect("bucket file");
        assert_eq!(
            "\u{feff}2,31.01.2024,10,OP-77,Kaspi Kredit\n3,31.01.2024,20,OP-77,Кредит на Покупки\n",
            content
        );
    }

    #[test]
    fn should_archive_a_sheet_without_remote_payments() {
        let (dir, input, rows) = setup(vec![data_row("Kaspi QR", "Kaspi Red", "1", "1")]);

        let report = exporter(&dir).export(&input, &rows).expect("report");

        assert!(bucket_dirs(dir.path()).is_empty());
        assert!(report.buckets.is_empty());
        assert!(dir.path().join(PROCESSED_DIR).join("export.xlsx").exists());
    }

    #[test]
    fn should_leave_outputs_and_input_in_place_when_archival_fails() {
        let (dir, input, rows) = setup(vec![data_row(
            REMOTE_PAYMENT_MARKER,
            "Kaspi Red",
            "Order 9",
            "100",
        )]);
        fs::create_dir(dir.path().join(PROCESSED_DIR)).expect("dir");
        fs::write(dir.path().join(PROCESSED_DIR).join("export.xlsx"), "previous run")
            .expect("file");

        let err = exporter(&dir)
            .export(&input, &rows)
            .expect_err("destination exists");

        assert!(matches!(err, ExportError::Archival { .. }));
        assert!(input.exists());
        let files = files_in(&dir.path().join("Kaspi Red"));
        assert_eq!(1, files.len());
        assert_eq!(
            "\u{feff}9,31.01.2024,100,OP-77,Kaspi Red\n",
            fs::read_to_string(&files[0]).expect("bucket file")
        );
        assert_eq!(
            "previous run",
            fs::read_to_string(dir.path().join(PROCESSED_DIR).join("export.xlsx")).expect("file")
        );
    }

    #[test]
    fn should_abort_on_an_invalid_amount_by_default() {
        let (dir, input, rows) = setup(vec![
            data_row(REMOTE_PAYMENT_MARKER, "Kaspi Red", "Order 1", "100"),
            data_row(REMOTE_PAYMENT_MARKER, "Kaspi Red", "Order 2", "n/a"),
            data_row(REMOTE_PAYMENT_MARKER, "Kaspi Red", "Order 3", "300"),
        ]);

        let err = exporter(&dir)
            .export(&input, &rows)
            .expect_err("invalid amount");

        assert!(matches!(err, ExportError::AmountParse { row: 3, .. }));
        assert!(input.exists());
        let files = files_in(&dir.path().join("Kaspi Red"));
        assert_eq!(
            "\u{feff}1,31.01.2024,100,OP-77,Kaspi Red\n",
            fs::read_to_string(&files[0]).expect("bucket file")
        );
    }

    #[test]
    fn should_skip_invalid_amounts_when_asked_to() {
        let (dir, input, rows) = setup(vec![
            data_row(REMOTE_PAYMENT_MARKER, "Kaspi Red", "Order 1", "100"),
            data_row(REMOTE_PAYMENT_MARKER, "Kaspi Red", "Order 2", "n/a"),
            data_row(REMOTE_PAYMENT_MARKER, "Kaspi Red", "Order 3", "300"),
        ]);

        let report = exporter(&dir)
            .amount_policy(AmountPolicy::Skip)
            .export(&input, &rows)
            .expect("report");

        assert_eq!(1, report.skipped_amount);
        assert_eq!(2, report.records_written);
        assert!(!input.exists());
        let files = files_in(&dir.path().join("Kaspi Red"));
        assert_eq!(
            "\u{feff}1,31.01.2024,100,OP-77,Kaspi Red\n3,31.01.2024,300,OP-77,Kaspi Red\n",
            fs::read_to_string(&files[0]).expect("bucket file")
        );
    }

    #[test]
    fn should_reject_a_sheet_missing_required_columns_before_writing_anything() {
        let dir = TempDir::new().expect("tempdir");
        let input = dir.path().join("export.xlsx");
        fs::write(&input, "workbook").expect("input");
        let rows = vec![
            vec!["Дата операции", "Канал оплаты", "Способ оплаты"],
            vec!["31.01.2024", REMOTE_PAYMENT_MARKER, "Kaspi Red"],
        ];

        let err = exporter(&dir).export(&input, &rows).expect_err("schema");

        assert!(matches!(err, ExportError::Schema { .. }));
        assert!(input.exists());
        assert_eq!(vec![input.clone()], files_in(dir.path()));
    }

    #[test]
    fn should_reject_an_empty_sheet() {
        let dir = TempDir::new().expect("tempdir");
        let input = dir.path().join("export.xlsx");
        let rows: Vec<Vec<&str>> = Vec::new();
        assert!(matches!(
            exporter(&dir).export(&input, &rows),
            Err(ExportError::SheetRead { .. })
        ));
    }

    #[test]
    fn should_fail_to_run_without_a_spreadsheet() {
        let dir = TempDir::new().expect("tempdir");
        assert!(matches!(
            exporter(&dir).run(),
            Err(ExportError::NoSpreadsheet { .. })
        ));
    }

    #[test]
    fn should_fail_to_run_on_an_unreadable_spreadsheet() {
        let dir = TempDir::new().expect("tempdir");
        let input = dir.path().join("export.xlsx");
        fs::write(&input, "not a workbook").expect("input");
        assert!(matches!(
            exporter(&dir).run(),
            Err(ExportError::SheetRead { .. })
        ));
        assert!(input.exists());
    }
}
