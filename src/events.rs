use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, U256};

use crate::error::{IndexerError, Result};
use crate::rpc::ChainLog;

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
    event Approval(address indexed owner, address indexed spender, uint256 value);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    Transfer {
        from: Address,
        to: Address,
        amount: U256,
    },
    Approval {
        owner: Address,
        spender: Address,
        amount: U256,
    },
}

/// A token event together with the log it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLog {
    pub event: DecodedEvent,
    pub log: ChainLog,
}

/// Decodes the token events of `target` out of `logs`, preserving order.
///
/// Logs of other contracts, logs without topics and unknown signatures are
/// skipped. A log whose signature matches but whose payload does not decode
/// is an error.
pub fn decode_logs(logs: &[ChainLog], target: Option<Address>) -> Result<Vec<DecodedLog>> {
    let Some(target) = target else {
        return Ok(Vec::new());
    };

    let mut decoded = Vec::new();
    for log in logs.iter().filter(|log| log.address == target) {
        let Some(topic0) = log.topics.first() else {
            continue;
        };

        let event = if *topic0 == Transfer::SIGNATURE_HASH {
            let event = Transfer::decode_raw_log(log.topics.iter().copied(), &log.data)
                .map_err(|e| decode_error("Transfer", log, e))?;
            DecodedEvent::Transfer {
                from: event.from,
                to: event.to,
                amount: event.value,
            }
        } else if *topic0 == Approval::SIGNATURE_HASH {
            let event = Approval::decode_raw_log(log.topics.iter().copied(), &log.data)
                .map_err(|e| decode_error("Approval", log, e))?;
            DecodedEvent::Approval {
                owner: event.owner,
                spender: event.spender,
                amount: event.value,
            }
        } else {
            continue;
        };

        decoded.push(DecodedLog {
            event,
            log: log.clone(),
        });
    }

    Ok(decoded)
}

fn decode_error(name: &str, log: &ChainLog, err: alloy::sol_types::Error) -> IndexerError {
    IndexerError::Decode(format!(
        "{name} log {} in tx {:?}: {err}",
        log.log_index, log.tx_hash
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TOKEN, addr, transfer_log};
    use alloy_primitives::{B256, Bytes};

    #[test]
    fn decodes_transfers_and_approvals_in_order() {
        let approval = Approval {
            owner: addr(1),
            spender: addr(2),
            value: U256::from(7),
        }
        .encode_log_data();
        let mut approval_log = transfer_log(B256::ZERO, 1, B256::ZERO, 1, addr(0), addr(1), 1);
        approval_log.topics = approval.topics().to_vec();
        approval_log.data = approval.data.clone();

        let logs = vec![
            transfer_log(B256::ZERO, 1, B256::ZERO, 0, addr(0), addr(1), 100),
            approval_log,
        ];
        let decoded = decode_logs(&logs, Some(TOKEN)).unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(
            decoded[0].event,
            DecodedEvent::Transfer {
                from: addr(0),
                to: addr(1),
                amount: U256::from(100),
            }
        );
        assert!(matches!(decoded[1].event, DecodedEvent::Approval { .. }));
    }

    #[test]
    fn skips_foreign_and_unknown_logs() {
        let mut foreign = transfer_log(B256::ZERO, 1, B256::ZERO, 0, addr(0), addr(1), 5);
        foreign.address = addr(9);
        let mut unknown = transfer_log(B256::ZERO, 1, B256::ZERO, 1, addr(0), addr(1), 5);
        unknown.topics = vec![B256::repeat_byte(0x77)];
        let mut bare = transfer_log(B256::ZERO, 1, B256::ZERO, 2, addr(0), addr(1), 5);
        bare.topics.clear();

        let logs = vec![foreign, unknown, bare];
        assert!(decode_logs(&logs, Some(TOKEN)).unwrap().is_empty());
        assert!(decode_logs(&logs, None).unwrap().is_empty());
    }

    #[test]
    fn malformed_transfer_is_a_decode_error() {
        let mut log = transfer_log(B256::ZERO, 1, B256::ZERO, 0, addr(0), addr(1), 5);
        log.data = Bytes::from(vec![1u8, 2, 3]);

        assert!(matches!(
            decode_logs(&[log], Some(TOKEN)),
            Err(IndexerError::Decode(_))
        ));
    }
}
