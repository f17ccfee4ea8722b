//! ABI codec for the loan record stored by the settlement contract

use crate::error::{ZeroError, ZeroResult};
use crate::request::{actions_token, Action, LiquidityRequest};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// Loan record written at `executeBorrow` and embedded in `BorrowProxyMade`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRecord {
    pub borrower: Address,
    pub token: Address,
    pub nonce: H256,
    pub amount: U256,
    pub forbid_loan: bool,
    pub actions: Vec<Action>,
    pub gas_requested: U256,
    pub keeper: Address,
    pub bond: U256,
    /// Block after which the loan may be defaulted
    pub timeout_expiry: U256,
}

fn action_type() -> ParamType {
    ParamType::Tuple(vec![ParamType::Address, ParamType::Bytes])
}

/// `(address borrower, address token, bytes32 nonce, uint256 amount, bool forbidLoan, (address,bytes)[] actions)`
pub(crate) fn request_type() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Address,
        ParamType::FixedBytes(32),
        ParamType::Uint(256),
        ParamType::Bool,
        ParamType::Array(Box::new(action_type())),
    ])
}

fn record_type() -> ParamType {
    ParamType::Tuple(vec![
        request_type(),
        ParamType::Uint(256),
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::Uint(256),
    ])
}

/// Tuple token of the request as the settlement contract sees it
pub(crate) fn request_token(request: &LiquidityRequest) -> Token {
    Token::Tuple(vec![
        Token::Address(request.borrower),
        Token::Address(request.token),
        Token::FixedBytes(request.nonce.as_bytes().to_vec()),
        Token::Uint(request.amount),
        Token::Bool(request.forbid_loan),
        actions_token(&request.actions),
    ])
}

impl ProxyRecord {
    /// Record the settlement contract stores for a borrow
    pub fn for_borrow(request: &LiquidityRequest, keeper: Address, bond: U256, timeout_expiry: U256) -> Self {
        Self {
            borrower: request.borrower,
            token: request.token,
            nonce: request.nonce,
            amount: request.amount,
            forbid_loan: request.forbid_loan,
            actions: request.actions.clone(),
            gas_requested: request.gas_requested,
            keeper,
            bond,
            timeout_expiry,
        }
    }

    /// Request fields under the given shifter pool
    pub fn to_request(&self, shifter_pool: Address) -> LiquidityRequest {
        LiquidityRequest {
            shifter_pool,
            token: self.token,
            amount: self.amount,
            nonce: self.nonce,
            borrower: self.borrower,
            forbid_loan: self.forbid_loan,
            gas_requested: self.gas_requested,
            actions: self.actions.clone(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let request = self.to_request(Address::zero());
        abi::encode(&[Token::Tuple(vec![
            request_token(&request),
            Token::Uint(self.gas_requested),
            Token::Address(self.keeper),
            Token::Uint(self.bond),
            Token::Uint(self.timeout_expiry),
        ])])
        .into()
    }

    pub fn decode(data: &[u8]) -> ZeroResult<Self> {
        let mut tokens = abi::decode(&[record_type()], data)?;
        let mut record = take_tuple(tokens.pop(), 5)?.into_iter();
        let mut request = take_tuple(record.next(), 6)?.into_iter();

        let borrower = take_address(request.next())?;
        let token = take_address(request.next())?;
        let nonce = take_bytes32(request.next())?;
        let amount = take_uint(request.next())?;
        let forbid_loan = match request.next() {
            Some(Token::Bool(b)) => b,
            other => return Err(unexpected("bool", other)),
        };
        let actions = match request.next() {
            Some(Token::Array(items)) => items
                .into_iter()
                .map(|item| {
                    let mut fields = take_tuple(Some(item), 2)?.into_iter();
                    let to = take_address(fields.next())?;
                    let calldata = match fields.next() {
                        Some(Token::Bytes(b)) => b,
                        other => return Err(unexpected("bytes", other)),
                    };
                    Ok(Action::new(to, calldata))
                })
                .collect::<ZeroResult<Vec<_>>>()?,
            other => return Err(unexpected("action array", other)),
        };

        Ok(Self {
            borrower,
            token,
            nonce,
            amount,
            forbid_loan,
            actions,
            gas_requested: take_uint(record.next())?,
            keeper: take_address(record.next())?,
            bond: take_uint(record.next())?,
            timeout_expiry: take_uint(record.next())?,
        })
    }
}

/// Argument of the proxy's `repayLoan(bytes)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerParcel {
    pub record: Bytes,
    pub phash: H256,
    pub vout: u32,
    pub txhash: H256,
    pub darknode_signature: Bytes,
}

impl TriggerParcel {
    pub fn encode(&self) -> Bytes {
        abi::encode(&[Token::Tuple(vec![
            Token::Bytes(self.record.to_vec()),
            Token::FixedBytes(self.phash.as_bytes().to_vec()),
            Token::Uint(U256::from(self.vout)),
            Token::FixedBytes(self.txhash.as_bytes().to_vec()),
            Token::Bytes(self.darknode_signature.to_vec()),
        ])])
        .into()
    }
}

fn unexpected(expected: &str, got: Option<Token>) -> ZeroError {
    ZeroError::Encoding(format!("expected {} in proxy record, got {:?}", expected, got))
}

fn take_tuple(token: Option<Token>, len: usize) -> ZeroResult<Vec<Token>> {
    match token {
        Some(Token::Tuple(fields)) if fields.len() == len => Ok(fields),
        other => Err(unexpected("tuple", other)),
    }
}

fn take_address(token: Option<Token>) -> ZeroResult<Address> {
    match token {
        Some(Token::Address(a)) => Ok(a),
        other => Err(unexpected("address", other)),
    }
}

fn take_uint(token: Option<Token>) -> ZeroResult<U256> {
    match token {
        Some(Token::Uint(v)) => Ok(v),
        other => Err(unexpected("uint256", other)),
    }
}

fn take_bytes32(token: Option<Token>) -> ZeroResult<H256> {
    match token {
        Some(Token::FixedBytes(b)) if b.len() == 32 => Ok(H256::from_slice(&b)),
        other => Err(unexpected("bytes32", other)),
    }
}
