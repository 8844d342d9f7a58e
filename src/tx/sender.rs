//! Bridge `sendNFT` transaction building and send-error classification

use crate::error::LedgerError;

use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use sha3::{Digest, Keccak256};
use std::str::FromStr;

/// Solidity signature of the bridge entry point
pub const SEND_NFT_SIGNATURE: &str = "sendNFT(uint64,address,uint256)";

/// Keccak-256 of a Solidity signature
pub fn keccak(signature: &str) -> [u8; 32] {
    Keccak256::digest(signature.as_bytes()).into()
}

/// A fully encoded call to the source chain's bridge contract
#[derive(Debug, Clone)]
pub struct BridgeCall {
    pub bridge: Address,
    pub destination_selector: u64,
    pub receiver: Address,
    pub token_id: U256,
}

impl BridgeCall {
    /// Parse the user-supplied receiver and asset id
    pub fn send_nft(
        bridge: Address,
        destination_selector: u64,
        receiver: &str,
        asset_id: &str,
    ) -> Result<Self, LedgerError> {
        let receiver = Address::from_str(receiver.trim()).map_err(|e| {
            LedgerError::InvalidParameters(format!("receiver '{}' is not an address: {}", receiver, e))
        })?;
        let token_id = U256::from_dec_str(asset_id.trim()).map_err(|e| {
            LedgerError::InvalidParameters(format!("asset id '{}' is not a token id: {}", asset_id, e))
        })?;

        Ok(Self {
            bridge,
            destination_selector,
            receiver,
            token_id,
        })
    }

    /// ABI-encoded calldata: selector followed by the three arguments
    pub fn calldata(&self) -> Bytes {
        let mut data = keccak(SEND_NFT_SIGNATURE)[..4].to_vec();
        data.extend(abi::encode(&[
            Token::Uint(U256::from(self.destination_selector)),
            Token::Address(self.receiver),
            Token::Uint(self.token_id),
        ]));
        data.into()
    }

    pub fn into_request(self, from: Address, gas_limit: u64) -> TransactionRequest {
        TransactionRequest::new()
            .from(from)
            .to(self.bridge)
            .data(self.calldata())
            .gas(gas_limit)
    }
}

/// Map a node's send error onto the ledger error taxonomy
pub fn classify_send_error(message: &str) -> LedgerError {
    let lower = message.to_lowercase();
    if lower.contains("insufficient funds") {
        LedgerError::InsufficientFunds(message.to_string())
    } else if lower.contains("execution reverted") || lower.contains("revert") {
        LedgerError::ContractReverted(message.to_string())
    } else {
        LedgerError::Network(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> Address {
        Address::repeat_byte(0xbb)
    }

    #[test]
    fn test_calldata_layout() {
        let call = BridgeCall::send_nft(
            bridge(),
            3478487238524512106,
            "0x00000000000000000000000000000000000000aa",
            "42",
        )
        .unwrap();
        let data = call.calldata();

        assert_eq!(data.len(), 4 + 3 * 32);
        assert_eq!(&data[..4], &keccak(SEND_NFT_SIGNATURE)[..4]);
        assert_eq!(
            U256::from_big_endian(&data[4..36]),
            U256::from(3478487238524512106u64)
        );
        assert_eq!(&data[48..68], Address::from_low_u64_be(0xaa).as_bytes());
        assert_eq!(U256::from_big_endian(&data[68..100]), U256::from(42));
    }

    #[test]
    fn test_bad_parameters_are_rejected() {
        let err = BridgeCall::send_nft(bridge(), 1, "0xABC", "42").unwrap_err();
        assert!(matches!(err, LedgerError::InvalidParameters(_)));

        let err = BridgeCall::send_nft(
            bridge(),
            1,
            "0x00000000000000000000000000000000000000aa",
            "forty-two",
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidParameters(_)));
    }

    #[test]
    fn test_request_targets_bridge() {
        let call = BridgeCall::send_nft(
            bridge(),
            1,
            "0x00000000000000000000000000000000000000aa",
            "7",
        )
        .unwrap();
        let request = call.into_request(Address::repeat_byte(0x01), 1_000_000);
        assert_eq!(request.gas, Some(U256::from(1_000_000u64)));
        assert_eq!(
            request.to,
            Some(ethers::types::NameOrAddress::Address(bridge()))
        );
    }

    #[test]
    fn test_send_error_classification() {
        assert!(matches!(
            classify_send_error("insufficient funds for gas * price + value"),
            LedgerError::InsufficientFunds(_)
        ));
        assert!(matches!(
            classify_send_error("execution reverted: not token owner"),
            LedgerError::ContractReverted(_)
        ));
        let err = classify_send_error("error sending request: connection refused");
        assert!(matches!(err, LedgerError::Network(_)));
        assert!(err.outcome_ambiguous());
    }
}
