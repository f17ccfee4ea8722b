//! End-to-end loan scenarios over in-memory chains

use super::*;
use crate::pubsub::LIQUIDITY_REQUEST_TOPIC;
use crate::testing::{borrower_wallet, keeper_wallet, utxo, AttestationMode, RecordingBackend, World};

use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn fast() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(5))
}

fn new_request() -> NewLiquidityRequest {
    NewLiquidityRequest {
        token: Address::repeat_byte(0x10),
        amount: U256::from(200_000_000u64),
        nonce: H256::repeat_byte(0x07),
        gas_requested: U256::from(21_000u64),
        actions: vec![Action::new(Address::repeat_byte(0x61), vec![0x01, 0x02])],
        ..Default::default()
    }
}

async fn signed_parcel(borrower: &Zero) -> LiquidityRequestParcel {
    let request = borrower.create_liquidity_request(new_request()).unwrap();
    borrower.sign(request).await.unwrap()
}

/// Deposit, wait, and borrow with the given expiry; returns the deposited parcel
async fn deposit_and_borrow(world: &World, keeper: &Zero, parcel: &LiquidityRequestParcel, expiry: u64) -> DepositedParcel {
    world.btc.deposit(parcel.deposit_address(), utxo(0x0d, 6, 200_000_000));
    let deposited = keeper
        .wait_for_deposit(parcel, &fast(), &CancellationToken::new())
        .await
        .unwrap();
    keeper
        .execute_borrow(&deposited, U256::from(1_000u64), U256::from(expiry), &TxOverrides::default())
        .await
        .unwrap();
    deposited
}

#[tokio::test]
async fn test_borrow_then_repay() {
    let world = World::new();
    let borrower = world.client(Some(borrower_wallet()));
    let keeper = world.client(Some(keeper_wallet()));

    let mut requests = keeper.listen_for_liquidity_requests();
    let parcel = signed_parcel(&borrower).await;
    borrower.broadcast(&parcel).await.unwrap();

    let received = timeout(WAIT, requests.next_item()).await.unwrap().unwrap();
    assert_eq!(received, parcel);
    assert_eq!(received.request.borrower, borrower_wallet().address());

    let expiry = world.settlement.block() + 50;
    deposit_and_borrow(&world, &keeper, &received, expiry).await;

    let proxies = borrower.get_borrow_proxies(None).await.unwrap();
    assert_eq!(proxies.len(), 1);
    let proxy = &proxies[0];
    assert_eq!(proxy.address(), parcel.proxy_address());
    assert_eq!(proxy.borrower(), borrower_wallet().address());
    assert_eq!(proxy.record().keeper, keeper_wallet().address());
    assert_eq!(proxy.get_deposit_address().unwrap(), parcel.deposit_address());

    let cancel = CancellationToken::new();
    assert!(!proxy.is_repaid().await.unwrap());
    proxy
        .repay_loan(&fast(), &cancel, &TxOverrides::default())
        .await
        .unwrap();
    assert_eq!(world.settlement.repaid(), 1);
    assert!(proxy.is_repaid().await.unwrap());

    let err = proxy
        .repay_loan(&fast(), &cancel, &TxOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ZeroError::RepaymentRejected { .. }));
    assert_eq!(world.settlement.repaid(), 1);

    requests.unsubscribe().await;
}

#[tokio::test]
async fn test_cancelled_deposit_wait_stops_polling() {
    let world = World::new();
    let borrower = world.client(Some(borrower_wallet()));
    let keeper = world.client(None);
    let parcel = signed_parcel(&borrower).await;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let waiter = keeper.clone();
    let handle = tokio::spawn(async move { waiter.wait_for_deposit(&parcel, &fast(), &token).await });

    tokio::time::sleep(Duration::from_millis(40)).await;
    cancel.cancel();

    let result = timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ZeroError::Cancelled { .. })));

    let polls = world.btc.polls();
    assert!(polls > 0);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(world.btc.polls(), polls);
    assert!(world.settlement.events().is_empty());
}

#[tokio::test]
async fn test_cancel_ends_wait_on_stalled_indexer() {
    let world = World::new();
    let borrower = world.client(Some(borrower_wallet()));
    let keeper = world.client(None);
    let parcel = signed_parcel(&borrower).await;
    world.btc.stall();

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let waiter = keeper.clone();
    let handle = tokio::spawn(async move { waiter.wait_for_deposit(&parcel, &fast(), &token).await });

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(world.btc.polls(), 1);
    cancel.cancel();

    let result = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ZeroError::Cancelled { .. })));
}

#[tokio::test]
async fn test_default_after_expiry_blocks_repayment() {
    let world = World::new();
    let borrower = world.client(Some(borrower_wallet()));
    let keeper = world.client(Some(keeper_wallet()));
    let parcel = signed_parcel(&borrower).await;

    let expiry = world.settlement.block() + 10;
    deposit_and_borrow(&world, &keeper, &parcel, expiry).await;

    let proxy = keeper.find_borrow_proxy(&parcel).await.unwrap().unwrap();
    let early = proxy.default_loan(&TxOverrides::default()).await.unwrap_err();
    assert!(matches!(early, ZeroError::DefaultRejected { .. }));

    world.settlement.advance_blocks(10);
    assert!(world.settlement.block() > expiry);
    proxy.default_loan(&TxOverrides::default()).await.unwrap();
    assert_eq!(world.settlement.defaulted(), 1);

    let borrower_view = borrower.find_borrow_proxy(&parcel).await.unwrap().unwrap();
    let err = borrower_view
        .repay_loan(&fast(), &CancellationToken::new(), &TxOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ZeroError::RepaymentRejected { .. }));
    assert_eq!(world.settlement.repaid(), 0);
}

#[tokio::test]
async fn test_repeated_waits_observe_same_deposit() {
    let world = World::new();
    let borrower = world.client(Some(borrower_wallet()));
    let parcel = signed_parcel(&borrower).await;
    world.btc.deposit(parcel.deposit_address(), utxo(0x0d, 8, 200_000_000));

    let cancel = CancellationToken::new();
    let first = borrower.wait_for_deposit(&parcel, &fast(), &cancel).await.unwrap();
    let second = borrower.wait_for_deposit(&parcel, &fast(), &cancel).await.unwrap();
    assert_eq!(first, second);

    let id = borrower.submit_to_attestation_network(&first).await.unwrap();
    let again = borrower.submit_to_attestation_network(&second).await.unwrap();
    assert_eq!(id, again);
    assert_eq!(world.renvm.submissions(), 2);
    assert_eq!(world.renvm.distinct_requests(), 1);
}

#[tokio::test]
async fn test_deposit_below_threshold_is_ignored() {
    let world = World::new();
    let borrower = world.client(Some(borrower_wallet()));
    let parcel = signed_parcel(&borrower).await;
    world.btc.deposit(parcel.deposit_address(), utxo(0x0d, 2, 200_000_000));

    assert!(borrower.qualifying_utxos(&parcel).await.unwrap().is_empty());

    let result = borrower
        .wait_for_deposit(&parcel, &fast().with_max_attempts(3), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(ZeroError::RetriesExhausted { attempts: 3, .. })));
}

#[tokio::test]
async fn test_transient_indexer_errors_are_retried() {
    let world = World::new();
    let borrower = world.client(Some(borrower_wallet()));
    let parcel = signed_parcel(&borrower).await;
    world.btc.deposit(parcel.deposit_address(), utxo(0x0d, 6, 200_000_000));
    world.btc.fail_next(2);

    let deposited = borrower
        .wait_for_deposit(&parcel, &fast(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(deposited.utxo.tx_hash, H256::repeat_byte(0x0d));
    assert_eq!(world.btc.polls(), 3);
}

#[tokio::test]
async fn test_rejected_attestation() {
    let world = World::new();
    world.renvm.set_mode(AttestationMode::Reject("utxo spent".into()));
    let borrower = world.client(Some(borrower_wallet()));
    let parcel = signed_parcel(&borrower).await;
    world.btc.deposit(parcel.deposit_address(), utxo(0x0d, 6, 200_000_000));

    let cancel = CancellationToken::new();
    let deposited = borrower.wait_for_deposit(&parcel, &fast(), &cancel).await.unwrap();

    // Not submitted yet, so the network reports it pending
    let pending = borrower
        .wait_for_signature(&deposited, &fast().with_max_attempts(2), &cancel)
        .await;
    assert!(matches!(pending, Err(ZeroError::RetriesExhausted { .. })));

    borrower.submit_to_attestation_network(&deposited).await.unwrap();
    let err = borrower
        .wait_for_signature(&deposited, &fast(), &cancel)
        .await
        .unwrap_err();
    match err {
        ZeroError::AttestationFailed { reason, .. } => assert_eq!(reason, "utxo spent"),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_listener_filters_foreign_and_malformed_messages() {
    let world = World::new();
    let borrower = world.client(Some(borrower_wallet()));
    let keeper = world.client(None);
    let mut requests = keeper.listen_for_liquidity_requests();
    let parcel = signed_parcel(&borrower).await;

    let mut foreign = parcel.to_message().unwrap();
    foreign.shifter_pool = Address::repeat_byte(0x99);
    world
        .channel
        .publish(LIQUIDITY_REQUEST_TOPIC, serde_json::to_value(foreign).unwrap())
        .await
        .unwrap();
    world
        .channel
        .publish(LIQUIDITY_REQUEST_TOPIC, json!({ "hello": "world" }))
        .await
        .unwrap();
    borrower.broadcast(&parcel).await.unwrap();

    let received = timeout(WAIT, requests.next_item()).await.unwrap().unwrap();
    assert_eq!(received.deposit_address(), parcel.deposit_address());

    requests.unsubscribe().await;
    assert!(!requests.is_active());
    assert!(requests.next_item().await.is_none());
    // Second unsubscribe is a no-op
    requests.unsubscribe().await;
}

#[tokio::test]
async fn test_shutdown_ends_subscriptions() {
    let world = World::new();
    let keeper = world.client(None);
    let mut requests = keeper.listen_for_liquidity_requests();

    keeper.shutdown();
    assert!(!requests.is_active());
    assert!(timeout(WAIT, requests.next_item()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_subscribe_borrows_yields_new_proxies_once() {
    let world = World::new();
    let borrower = world.client(Some(borrower_wallet()));
    let keeper = world.client(Some(keeper_wallet()));
    let parcel = signed_parcel(&borrower).await;

    let mut borrows = keeper.subscribe_borrows(None, fast()).await.unwrap();
    deposit_and_borrow(&world, &keeper, &parcel, world.settlement.block() + 50).await;

    let proxy = timeout(WAIT, borrows.next_item()).await.unwrap().unwrap();
    assert_eq!(proxy.address(), parcel.proxy_address());

    world.settlement.advance_blocks(3);
    let again = timeout(Duration::from_millis(60), borrows.next_item()).await;
    assert!(again.is_err());

    borrows.unsubscribe().await;
}

#[tokio::test]
async fn test_borrow_proxy_routing() {
    let world = World::new();
    let borrower = world.client(Some(borrower_wallet()));
    let keeper = world.client(Some(keeper_wallet()));
    let parcel = signed_parcel(&borrower).await;
    deposit_and_borrow(&world, &keeper, &parcel, world.settlement.block() + 50).await;

    let proxy = borrower.find_borrow_proxy(&parcel).await.unwrap().unwrap();
    borrower.set_borrow_proxy(&proxy).await.unwrap();
    assert!(borrower.driver().is_intercepted("ethereum").await.unwrap());
    assert!(!keeper.driver().is_intercepted("ethereum").await.unwrap());

    let accounts = borrower.driver().send_wrapped("eth_accounts", vec![]).await.unwrap();
    assert_eq!(accounts, json!([borrower_wallet().address()]));

    let active = borrower
        .driver()
        .send_wrapped("0cf_getBorrowProxy", vec![])
        .await
        .unwrap();
    assert_eq!(active, json!(proxy.address()));

    borrower
        .driver()
        .send_wrapped(
            "eth_sendTransaction",
            vec![json!({ "to": Address::repeat_byte(0x61), "data": "0x01" })],
        )
        .await
        .unwrap();
    let sent = world.eth.last_call("eth_sendTransaction").unwrap();
    assert_eq!(sent.params[0]["to"], json!(proxy.address()));

    proxy.view(Address::repeat_byte(0x61), vec![0x70, 0xa0].into()).await.unwrap();
    let call = world.eth.last_call("eth_call").unwrap();
    assert_eq!(call.params[0]["from"], json!(proxy.address()));

    assert!(proxy.query_transfers(None).await.unwrap().is_empty());

    borrower.clear_borrow_proxy().await.unwrap();
    assert!(!borrower.driver().is_intercepted("ethereum").await.unwrap());
    let cleared = borrower
        .driver()
        .send_wrapped("0cf_getBorrowProxy", vec![])
        .await
        .unwrap();
    assert!(cleared.is_null());
}

#[tokio::test]
async fn test_request_defaults_to_signer() {
    let world = World::new();
    let anonymous = world.client(None);
    assert!(matches!(
        anonymous.create_liquidity_request(new_request()),
        Err(ZeroError::SigningUnavailable)
    ));

    let request = anonymous
        .create_liquidity_request(NewLiquidityRequest {
            borrower: Some(borrower_wallet().address()),
            ..new_request()
        })
        .unwrap();
    assert!(matches!(anonymous.sign(request).await, Err(ZeroError::SigningUnavailable)));
}

#[test]
fn test_utxo_selection() {
    let utxos = [utxo(0x01, 6, 10), utxo(0x02, 6, 30), utxo(0x03, 6, 30)];

    assert_eq!(UtxoSelection::First.select(&utxos), Some(utxos[0]));
    assert_eq!(UtxoSelection::LargestValue.select(&utxos), Some(utxos[1]));
    assert_eq!(UtxoSelection::First.select(&[]), None);
}

#[tokio::test]
async fn test_liquidity_provider_operations() {
    let token = Address::repeat_byte(0x10);
    let handler = Address::repeat_byte(0x77);
    let code = vec![0x60u8, 0x80, 0x60, 0x40];
    let answer = code.clone();
    let eth = RecordingBackend::ethereum_with(keeper_wallet().address(), move |request| {
        if request.method != "eth_call" {
            return None;
        }
        let data = request.params[0]["data"].as_str().unwrap_or_default();
        let encoded = if data.starts_with(&format!("0x{}", hex::encode(ethers::utils::id("getLiquidityTokenHandler(address)")))) {
            ethers::abi::encode(&[ethers::abi::Token::Address(handler)])
        } else {
            ethers::abi::encode(&[ethers::abi::Token::Bytes(answer.clone())])
        };
        Some(Ok(json!(Bytes::from(encoded))))
    });
    let world = World::with_settlement_chain(eth);
    let mut provider = world.client(Some(keeper_wallet()));
    let overrides = TxOverrides::default();

    assert_eq!(provider.get_liquidity_token_for(token).await.unwrap(), handler);
    provider.approve_pool(token, &overrides).await.unwrap();
    provider.approve_liquidity_token(token, &overrides).await.unwrap();
    provider.add_liquidity(token, U256::from(1_000u64), &overrides).await.unwrap();
    provider.remove_liquidity(token, U256::from(400u64), &overrides).await.unwrap();

    let sent: Vec<Value> = world
        .eth
        .calls()
        .into_iter()
        .filter(|call| call.method == "eth_sendTransaction")
        .map(|call| call.params[0]["to"].clone())
        .collect();
    assert_eq!(sent, vec![json!(token), json!(token), json!(handler), json!(handler)]);
    // Provider calls are never rerouted through a borrow proxy
    assert!(!provider.driver().is_intercepted("ethereum").await.unwrap());

    let before = signed_parcel(&provider).await.proxy_address();
    let zero = Arc::get_mut(&mut provider).unwrap();
    let hash = zero.load_borrow_proxy_creation_code().await.unwrap();
    assert_eq!(hash, H256::from(keccak256(&code)));
    assert_eq!(provider.params().borrow_proxy_code_hash, hash);
    assert_ne!(signed_parcel(&provider).await.proxy_address(), before);
}
