use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::VmError;

/// The JSON body of a contract-call transaction's payload.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ContractCallPayload {
    /// Hex of the deploy transaction id.
    pub contract_address: String,
    pub function_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

pub fn make_call_payload(
    contract_address: &str,
    function_name: &str,
    args: Vec<Value>,
) -> Result<Vec<u8>, VmError> {
    let payload = ContractCallPayload {
        contract_address: contract_address.to_owned(),
        function_name: function_name.to_owned(),
        args,
    };

    Ok(serde_json::to_vec(&payload)?)
}

pub fn parse_call_payload(data: &[u8]) -> Result<ContractCallPayload, VmError> {
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip() {
        let bytes = make_call_payload("aabbcc", "set", vec![json!("k"), json!(1)]).unwrap();
        let payload = parse_call_payload(&bytes).unwrap();

        assert_eq!(payload.contract_address, "aabbcc");
        assert_eq!(payload.function_name, "set");
        assert_eq!(payload.args, vec![json!("k"), json!(1)]);
    }

    #[test]
    fn args_default_to_empty() {
        let payload =
            parse_call_payload(br#"{"contract_address":"00","function_name":"f"}"#).unwrap();

        assert!(payload.args.is_empty());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_call_payload(b"not json").is_err());
        assert!(parse_call_payload(b"[1,2,3]").is_err());
    }
}
