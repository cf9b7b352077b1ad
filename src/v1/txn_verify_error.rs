use std::error::{self, Error as StdError};
use std::fmt;

use serde::{Deserialize, Serialize};

pub type TxnVerifyResult<T> = std::result::Result<T, TxnVerifyError>;

pub type TxnVerifyError = Box<ErrorKind>;

#[derive(Debug, Serialize, Deserialize)]
pub enum ErrorKind {
    EmptyVin,
    EmptyVout,
    Coinbase,
    InvalidId,
    NegativeOutput(i64),
    MissingInput(Vec<u8>),
    BadInputRef(Vec<u8>, i32),
    SpentOutput(Vec<u8>, i32),
    KeyMismatch(Vec<u8>, i32),
    BadKeyLength(usize),
    BadSignatureLength(usize),
    BadSignature(usize),
    Overspend(i64, i64),
    StoreUnavailable,
}

impl StdError for ErrorKind {
    fn description(&self) -> &str {
        match *self {
            ErrorKind::EmptyVin => "Transaction has no inputs",
            ErrorKind::EmptyVout => "Transaction has no outputs",
            ErrorKind::Coinbase => "Coinbase transactions cannot be submitted or relayed",
            ErrorKind::InvalidId => "Transaction id does not match its canonical hash",
            ErrorKind::NegativeOutput(_) => "Transaction output value is negative",
            ErrorKind::MissingInput(_) => "Transaction input references a transaction that does not exist",
            ErrorKind::BadInputRef(_, _) => "Transaction input references an output index that does not exist",
            ErrorKind::SpentOutput(_, _) => "Transaction input references an output that has already been spent",
            ErrorKind::KeyMismatch(_, _) => "Input public key does not hash to the referenced output's locking hash",
            ErrorKind::BadKeyLength(_) => "Input public key has the wrong length",
            ErrorKind::BadSignatureLength(_) => "Input signature has the wrong length",
            ErrorKind::BadSignature(_) => "Input signature failed verification",
            ErrorKind::Overspend(_, _) => "Transaction outputs exceed its inputs",
            ErrorKind::StoreUnavailable => "Could not read the UTXO index while verifying",
        }
    }

    fn cause(&self) -> Option<&dyn error::Error> {
        None
    }
}

impl fmt::Display for ErrorKind {
    #[allow(deprecated)]
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match &*self {
            ErrorKind::EmptyVin => write!(fmt, "{}", self.description()),
            ErrorKind::EmptyVout => write!(fmt, "{}", self.description()),
            ErrorKind::Coinbase => write!(fmt, "{}", self.description()),
            ErrorKind::InvalidId => write!(fmt, "{}", self.description()),
            ErrorKind::NegativeOutput(val) => write!(fmt, "{}: {}", self.description(), val),
            ErrorKind::MissingInput(hash) => {
                write!(fmt, "{}: {}", self.description(), hex::encode(hash))
            }
            ErrorKind::BadInputRef(hash, idx) => write!(
                fmt,
                "{}: transaction {}, output {}",
                self.description(),
                hex::encode(hash),
                idx
            ),
            ErrorKind::SpentOutput(hash, idx) => write!(
                fmt,
                "{}: transaction {}, output {}",
                self.description(),
                hex::encode(hash),
                idx
            ),
            ErrorKind::KeyMismatch(hash, idx) => write!(
                fmt,
                "{}: transaction {}, output {}",
                self.description(),
                hex::encode(hash),
                idx
            ),
            ErrorKind::BadKeyLength(len) => {
                write!(fmt, "{}: got {} bytes", self.description(), len)
            }
            ErrorKind::BadSignatureLength(len) => {
                write!(fmt, "{}: got {} bytes", self.description(), len)
            }
            ErrorKind::BadSignature(input) => {
                write!(fmt, "{}: input {}", self.description(), input)
            }
            ErrorKind::Overspend(input_sum, output_sum) => write!(
                fmt,
                "{}: tried to spend {} with only {} provided as input",
                self.description(),
                output_sum,
                input_sum
            ),
            ErrorKind::StoreUnavailable => write!(fmt, "{}", self.description()),
        }
    }
}
