use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::model::{ParseStageError, Stage};
use crate::{Amount, Command, Deal, DealId, ListingId, OfferId, UserId};

/// Errors that can occur when reading or writing csv rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("cannot open command file: {0}")]
    Open(csv::Error),

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized op '{op}'")]
    UnrecognizedOp { line: usize, op: String },

    #[error("line {line}: {op} missing {field}")]
    MissingField {
        line: usize,
        op: String,
        field: &'static str,
    },

    #[error("line {line}: invalid amount {value}")]
    InvalidAmount { line: usize, value: f64 },

    #[error("line {line}: {source}")]
    InvalidStage {
        line: usize,
        source: ParseStageError,
    },

    #[error("cannot write deal report: {0}")]
    Write(#[from] csv::Error),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    op: String,
    actor: UserId,
    id: u64,
    amount: Option<f64>,
    stage: Option<String>,
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    deal: DealId,
    offer: OfferId,
    listing: ListingId,
    buyer: UserId,
    seller: UserId,
    amount: String,
    stage: &'a str,
    status: String,
}

/// Read commands from a csv file with the columns
/// `op,actor,id,amount,stage,text`.
pub fn read_commands(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Command, CsvError>>, CsvError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(CsvError::Open)?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_row(line, row)
        }))
}

fn parse_row(line: usize, row: InputRow) -> Result<Command, CsvError> {
    let missing = |field| CsvError::MissingField {
        line,
        op: row.op.clone(),
        field,
    };
    let amount = row
        .amount
        .map(|value| {
            Amount::checked_from_float(value).ok_or(CsvError::InvalidAmount { line, value })
        })
        .transpose()?;

    let command = match row.op.as_str() {
        "listing" => Command::RegisterListing {
            listing: row.id,
            seller: row.actor,
            title: row.text.clone().unwrap_or_default(),
        },
        "submit" => Command::Submit {
            buyer: row.actor,
            listing: row.id,
            amount: amount.ok_or_else(|| missing("amount"))?,
            message: row.text.clone(),
        },
        "withdraw" => Command::Withdraw {
            buyer: row.actor,
            offer: row.id,
        },
        "counter" => Command::Counter {
            seller: row.actor,
            offer: row.id,
            amount: amount.ok_or_else(|| missing("amount"))?,
        },
        "renegotiate" => Command::Renegotiate {
            buyer: row.actor,
            offer: row.id,
            amount: amount.ok_or_else(|| missing("amount"))?,
            message: row.text.clone(),
        },
        "accept" => Command::Accept {
            actor: row.actor,
            offer: row.id,
        },
        "reject" => Command::Reject {
            seller: row.actor,
            offer: row.id,
        },
        "stage" => {
            let name = row.stage.as_deref().ok_or_else(|| missing("stage"))?;
            let stage = name
                .parse::<Stage>()
                .map_err(|source| CsvError::InvalidStage { line, source })?;
            Command::UpdateStage {
                actor: row.actor,
                deal: row.id,
                stage,
                amount,
                notes: row.text.clone(),
            }
        }
        "post" => Command::Post {
            sender: row.actor,
            conversation: row.id,
            content: row.text.clone().ok_or_else(|| missing("text"))?,
        },
        "open" => Command::Open {
            viewer: row.actor,
            conversation: row.id,
        },
        other => {
            return Err(CsvError::UnrecognizedOp {
                line,
                op: other.to_string(),
            });
        }
    };
    Ok(command)
}

/// Write deals in csv format
pub fn write_deals(out: impl io::Write, deals: &[Deal]) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(out);

    for deal in deals {
        let row = OutputRow {
            deal: deal.id,
            offer: deal.offer,
            listing: deal.listing,
            buyer: deal.buyer,
            seller: deal.seller,
            amount: deal.amount.to_string(),
            stage: deal.stage.name(),
            status: deal.status().to_string(),
        };
        writer.serialize(&row)?;
    }

    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "op,actor,id,amount,stage,text\n";

    fn write_csv(rows: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(rows.as_bytes()).unwrap();
        file
    }

    fn read(rows: &str) -> Vec<Result<Command, CsvError>> {
        let file = write_csv(rows);
        read_commands(file.path()).unwrap().collect()
    }

    #[test]
    fn read_submit() {
        let results = read("submit,10,1,100.50,,cash buyer\n");
        assert_eq!(results.len(), 1);

        match results.into_iter().next().unwrap().unwrap() {
            Command::Submit {
                buyer,
                listing,
                amount,
                message,
            } => {
                assert_eq!(buyer, 10);
                assert_eq!(listing, 1);
                assert_eq!(amount, Amount::from_minor(10050));
                assert_eq!(message.as_deref(), Some("cash buyer"));
            }
            other => panic!("expected submit, got {other:?}"),
        }
    }

    #[test]
    fn read_stage_with_alias_and_reprice() {
        let results = read("stage,20,3,95,due_diligence,inspection booked\n");
        match results.into_iter().next().unwrap().unwrap() {
            Command::UpdateStage {
                actor,
                deal,
                stage,
                amount,
                notes,
            } => {
                assert_eq!(actor, 20);
                assert_eq!(deal, 3);
                assert_eq!(stage, Stage::DueDiligence);
                assert_eq!(amount, Some(Amount::from_major(95)));
                assert_eq!(notes.as_deref(), Some("inspection booked"));
            }
            other => panic!("expected stage update, got {other:?}"),
        }
    }

    #[test]
    fn read_with_whitespace() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            "op, actor, id, amount, stage, text\naccept, 20, 1, , ,\n",
        )
        .unwrap();
        let results: Vec<_> = read_commands(file.path()).unwrap().collect();
        assert!(matches!(
            results[0],
            Ok(Command::Accept {
                actor: 20,
                offer: 1
            })
        ));
    }

    #[test]
    fn read_returns_error_for_unknown_op() {
        let results = read("bid,10,1,10.0,,\n");
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(err, CsvError::UnrecognizedOp { line: 2, .. }));
    }

    #[test]
    fn read_returns_error_for_missing_amount() {
        let results = read("listing,20,1,,,Cafe\ncounter,20,1,,,\n");
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert!(matches!(
            err,
            CsvError::MissingField {
                line: 3,
                field: "amount",
                ..
            }
        ));
        assert_eq!(err.to_string(), "line 3: counter missing amount");
    }

    #[test]
    fn read_returns_error_for_unrepresentable_amount() {
        let results = read("submit,10,1,-1e300,,\ncounter,20,1,-inf,,\nsubmit,10,1,-3,,\n");
        assert!(matches!(
            results[0],
            Err(CsvError::InvalidAmount { line: 2, .. })
        ));
        assert!(matches!(
            results[1],
            Err(CsvError::InvalidAmount { line: 3, .. })
        ));
        // negative but representable amounts are left to the ledger
        assert!(matches!(
            results[2],
            Ok(Command::Submit { amount, .. }) if amount == Amount::from_major(-3)
        ));
    }

    #[test]
    fn read_returns_error_for_unknown_stage() {
        let results = read("stage,20,1,,Escrow,\n");
        assert!(matches!(
            results[0],
            Err(CsvError::InvalidStage { line: 2, .. })
        ));
    }

    #[test]
    fn missing_file_is_an_open_error() {
        assert!(matches!(
            read_commands("/nonexistent/commands.csv"),
            Err(CsvError::Open(_))
        ));
    }

    #[test]
    fn write_deal_rows() {
        let now = Utc::now();
        let deal = Deal {
            id: 1,
            offer: 4,
            listing: 2,
            buyer: 10,
            seller: 20,
            amount: Amount::from_major(110),
            stage: Stage::LoiSigned,
            notes: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let mut out = Vec::new();
        write_deals(&mut out, &[deal]).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "deal,offer,listing,buyer,seller,amount,stage,status\n\
             1,4,2,10,20,110.00,LOI Signed,loi\n"
        );
    }
}
