//! Batch script reader and balance writer for the command line.
//!
//! Scripts have the header `op,user,account,target,amount,secret`. `user`
//! is who performs the step. Per op:
//!
//! | op              | account      | target                    | amount | secret   |
//! |-----------------|--------------|---------------------------|--------|----------|
//! | `register`      |              |                           |        | password |
//! | `login`         |              |                           |        | password |
//! | `logout`        |              |                           |        |          |
//! | `set_pin`       |              |                           |        | pin      |
//! | `cash_deposit`  | `SAV`/`CHK`  |                           | yes    |          |
//! | `check_deposit` | `SAV`/`CHK`  | check number              | yes    |          |
//! | `wire`          | `SAV`/`CHK`  | `sender|bank`             | yes    | pin      |
//! | `transfer`      | `SAV`/`CHK`  | `@user:KIND` or a number  | yes    | pin      |
//! | `clear_checks`  |              |                           |        |          |
//! | `set_role`      | role/`none`  | username                  |        |          |
//! | `open_account`  | `SAV`/`CHK`  | owner username            |        |          |
//! | `deactivate`    |              | `@user:KIND` or a number  |        |          |

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Amount;
use crate::bank::{AccountRef, AccountSummary, Action, Step};
use crate::model::{AccountKind, Role};

/// Errors that can occur when reading a script
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("cannot open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized op '{op}'")]
    UnrecognizedOp { line: usize, op: String },

    #[error("line {line}: {op} missing {field}")]
    Missing {
        line: usize,
        op: String,
        field: &'static str,
    },

    #[error("line {line}: invalid {field} '{value}'")]
    Invalid {
        line: usize,
        field: &'static str,
        value: String,
    },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    op: String,
    user: String,
    account: Option<String>,
    target: Option<String>,
    amount: Option<String>,
    secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    owner: &'a str,
    r#type: &'a str,
    balance: String,
    active: bool,
}

/// Read script steps from a csv file
pub fn read_steps(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Step, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_row(line, row)
        }))
}

/// Write account balances in csv format
pub fn write_accounts<'a, W: io::Write>(
    writer: W,
    accounts: impl IntoIterator<Item = &'a AccountSummary>,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);
    for account in accounts {
        writer.serialize(OutputRow {
            owner: &account.owner,
            r#type: account.kind.as_str(),
            balance: account.balance.to_string(),
            active: account.active,
        })?;
    }
    writer.flush()?;
    Ok(())
}

fn parse_row(line: usize, row: InputRow) -> Result<Step, CsvError> {
    let fields = Fields { line, row: &row };
    let action = match row.op.as_str() {
        "register" => Action::Register {
            password: fields.required("secret", &row.secret)?,
        },
        "login" => Action::Login {
            password: fields.required("secret", &row.secret)?,
        },
        "logout" => Action::Logout,
        "set_pin" => Action::SetPin {
            pin: fields.required("secret", &row.secret)?,
        },
        "cash_deposit" => Action::CashDeposit {
            account: fields.kind()?,
            amount: fields.amount()?,
        },
        "check_deposit" => Action::CheckDeposit {
            account: fields.kind()?,
            amount: fields.amount()?,
            check_number: fields.required("target", &row.target)?,
        },
        "wire" => {
            let target = fields.required("target", &row.target)?;
            let (sender, bank) = target
                .split_once('|')
                .map(|(s, b)| (s.trim().to_string(), b.trim().to_string()))
                .filter(|(s, b)| !s.is_empty() && !b.is_empty())
                .ok_or_else(|| CsvError::Invalid {
                    line,
                    field: "target",
                    value: target.clone(),
                })?;
            Action::Wire {
                account: fields.kind()?,
                amount: fields.amount()?,
                sender,
                bank,
                pin: fields.required("secret", &row.secret)?,
            }
        }
        "transfer" => Action::Transfer {
            account: fields.kind()?,
            to: fields.account_ref()?,
            amount: fields.amount()?,
            pin: fields.required("secret", &row.secret)?,
        },
        "clear_checks" => Action::ClearChecks,
        "set_role" => {
            let role = fields.required("account", &row.account)?;
            let role = if role.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(role.parse::<Role>().map_err(|_| CsvError::Invalid {
                    line,
                    field: "account",
                    value: role.clone(),
                })?)
            };
            Action::SetRole {
                target: fields.required("target", &row.target)?,
                role,
            }
        }
        "open_account" => Action::OpenAccount {
            owner: fields.required("target", &row.target)?,
            kind: fields.kind()?,
        },
        "deactivate" => Action::Deactivate {
            account: fields.account_ref()?,
        },
        other => {
            return Err(CsvError::UnrecognizedOp {
                line,
                op: other.to_string(),
            });
        }
    };
    Ok(Step {
        line,
        user: row.user.clone(),
        action,
    })
}

struct Fields<'a> {
    line: usize,
    row: &'a InputRow,
}

impl Fields<'_> {
    fn required(&self, field: &'static str, value: &Option<String>) -> Result<String, CsvError> {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| CsvError::Missing {
                line: self.line,
                op: self.row.op.clone(),
                field,
            })
    }

    fn kind(&self) -> Result<AccountKind, CsvError> {
        let raw = self.required("account", &self.row.account)?;
        raw.parse().map_err(|_| self.invalid("account", raw))
    }

    fn amount(&self) -> Result<Amount, CsvError> {
        let raw = self.required("amount", &self.row.amount)?;
        raw.parse().map_err(|_| self.invalid("amount", raw))
    }

    /// `@user:KIND` names a registered user's account; anything else is a raw number.
    fn account_ref(&self) -> Result<AccountRef, CsvError> {
        let raw = self.required("target", &self.row.target)?;
        let Some(alias) = raw.strip_prefix('@') else {
            return Ok(AccountRef::Number(raw));
        };
        let (username, kind) = alias
            .split_once(':')
            .ok_or_else(|| self.invalid("target", raw.clone()))?;
        let kind = kind
            .parse()
            .map_err(|_| self.invalid("target", raw.clone()))?;
        Ok(AccountRef::Alias {
            username: username.to_string(),
            kind,
        })
    }

    fn invalid(&self, field: &'static str, value: String) -> CsvError {
        CsvError::Invalid {
            line: self.line,
            field,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "op,user,account,target,amount,secret\n";

    fn write_csv(rows: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(rows.as_bytes()).unwrap();
        file
    }

    fn read(rows: &str) -> Vec<Result<Step, CsvError>> {
        let file = write_csv(rows);
        read_steps(file.path()).unwrap().collect()
    }

    #[test]
    fn read_transfer_to_alias() {
        let steps = read("transfer,alice,SAV,@bob:CHK,10.50,1234\n");
        let step = steps.into_iter().next().unwrap().unwrap();
        assert_eq!(step.line, 2);
        assert_eq!(step.user, "alice");
        assert_eq!(
            step.action,
            Action::Transfer {
                account: AccountKind::Savings,
                to: AccountRef::Alias {
                    username: "bob".into(),
                    kind: AccountKind::Checking,
                },
                amount: Amount::from_cents(1_050),
                pin: "1234".into(),
            }
        );
    }

    #[test]
    fn read_external_transfer_and_wire() {
        let steps = read(
            "transfer,alice,CHK,EXT-42,5,1234\n\
             wire,alice,SAV,Acme Corp|First Bank,250,1234\n",
        );
        assert!(matches!(
            &steps[0],
            Ok(Step { action: Action::Transfer { to: AccountRef::Number(n), .. }, .. }) if n == "EXT-42"
        ));
        match &steps[1] {
            Ok(Step {
                action: Action::Wire { sender, bank, .. },
                ..
            }) => {
                assert_eq!(sender, "Acme Corp");
                assert_eq!(bank, "First Bank");
            }
            other => panic!("expected wire, got {other:?}"),
        }
    }

    #[test]
    fn read_with_whitespace_and_empty_columns() {
        let steps = read("logout, alice, , , ,\n set_role , admin , none , bob , ,\n");
        assert_eq!(steps[0].as_ref().unwrap().action, Action::Logout);
        assert_eq!(
            steps[1].as_ref().unwrap().action,
            Action::SetRole {
                target: "bob".into(),
                role: None,
            }
        );
    }

    #[test]
    fn read_returns_error_for_unknown_op() {
        let steps = read("withdraw,alice,SAV,,10,\n");
        assert!(matches!(
            steps[0].as_ref().unwrap_err(),
            CsvError::UnrecognizedOp { line: 2, .. }
        ));
    }

    #[test]
    fn read_returns_error_for_missing_and_bad_fields() {
        let steps = read(
            "cash_deposit,alice,SAV,,,\n\
             cash_deposit,alice,SAV,,1.234,\n\
             wire,alice,SAV,no separator,10,1234\n\
             cash_deposit,alice,BROKERAGE,,10,\n",
        );
        assert!(matches!(
            steps[0].as_ref().unwrap_err(),
            CsvError::Missing { line: 2, field: "amount", .. }
        ));
        assert!(matches!(
            steps[1].as_ref().unwrap_err(),
            CsvError::Invalid { line: 3, field: "amount", .. }
        ));
        assert!(matches!(
            steps[2].as_ref().unwrap_err(),
            CsvError::Invalid { line: 4, field: "target", .. }
        ));
        assert!(matches!(
            steps[3].as_ref().unwrap_err(),
            CsvError::Invalid { line: 5, field: "account", .. }
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            read_steps("/definitely/not/here.csv"),
            Err(CsvError::Open { .. })
        ));
    }

    #[test]
    fn write_balances() {
        let rows = vec![AccountSummary {
            owner: "alice".into(),
            number: "SAV202401011234".into(),
            kind: AccountKind::Savings,
            balance: Amount::from_cents(6_000),
            active: true,
        }];
        let mut out = Vec::new();
        write_accounts(&mut out, &rows).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "owner,type,balance,active\nalice,Savings,60.00,true\n"
        );
    }
}
