//! In-process stand-ins for the blockchain node, card gateway, object store
//! and mail relay.
//!
//! They keep just enough state to honor the port contracts (idempotency keys,
//! token balances, virus scanning) and expose failure switches so the
//! workflows can be exercised against misbehaving collaborators.

use crate::domain::document::ScanStatus;
use crate::domain::money::Money;
use crate::domain::ports::{
    BlockchainClient, Charge, ChargeRequest, MintReceipt, MintRequest, Notification, Notifier,
    ObjectStorage, PaymentGateway, RetireRequest, Services, TransferRequest,
};
use crate::error::{MarketError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Signature of the EICAR antivirus test file.
const EICAR_SIGNATURE: &[u8] = b"EICAR-STANDARD-ANTIVIRUS-TEST-FILE";

fn hash_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

#[derive(Default)]
struct Ledger {
    next_token: u64,
    nonce: u64,
    balances: HashMap<(String, String), Decimal>,
    mints: HashMap<String, MintReceipt>,
    transfers: HashMap<String, String>,
    retirements: HashMap<String, String>,
    payments: HashMap<String, (Money, String)>,
}

impl Ledger {
    fn next_hash(&mut self, key: &str) -> String {
        self.nonce += 1;
        format!("0x{}", hash_hex(&[key.as_bytes(), &self.nonce.to_be_bytes()]))
    }
}

/// A single-contract token ledger.
#[derive(Default)]
pub struct SimulatedBlockchain {
    ledger: Mutex<Ledger>,
    fail_mints: AtomicBool,
    fail_transfers: AtomicU32,
    latency_ms: AtomicU64,
    transfer_calls: AtomicU32,
}

impl SimulatedBlockchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_mints(&self, fail: bool) {
        self.fail_mints.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` transfer calls fail; `u32::MAX` fails them all.
    pub fn fail_transfers(&self, count: u32) {
        self.fail_transfers.store(count, Ordering::SeqCst);
    }

    /// Delays every call, to exercise timeouts.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of transfer calls received, including failed ones.
    pub fn transfer_calls(&self) -> u32 {
        self.transfer_calls.load(Ordering::SeqCst)
    }

    pub async fn balance(&self, token_id: &str, address: &str) -> Decimal {
        let ledger = self.ledger.lock().await;
        ledger
            .balances
            .get(&(token_id.to_string(), address.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// Records an on-chain payment as if a buyer had sent it from their wallet.
    pub async fn record_payment(&self, amount: Money, token_id: &str) -> String {
        let mut ledger = self.ledger.lock().await;
        let hash = ledger.next_hash(token_id);
        ledger
            .payments
            .insert(hash.clone(), (amount, token_id.to_string()));
        hash
    }

    /// Applies a transfer without going through the port, as a crash between
    /// the chain call and the local write would leave things.
    pub async fn force_transfer(&self, request: TransferRequest) -> Result<String> {
        let mut ledger = self.ledger.lock().await;
        Self::apply_transfer(&mut ledger, &request)
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn apply_transfer(ledger: &mut Ledger, request: &TransferRequest) -> Result<String> {
        if let Some(hash) = ledger.transfers.get(&request.idempotency_key) {
            return Ok(hash.clone());
        }
        let from = (request.token_id.clone(), request.from.clone());
        let balance = ledger.balances.get(&from).copied().unwrap_or_default();
        if balance < request.amount.value() {
            return Err(MarketError::BlockchainError(
                "Insufficient token balance".into(),
            ));
        }
        ledger.balances.insert(from, balance - request.amount.value());
        *ledger
            .balances
            .entry((request.token_id.clone(), request.to.clone()))
            .or_default() += request.amount.value();
        let hash = ledger.next_hash(&request.idempotency_key);
        ledger
            .transfers
            .insert(request.idempotency_key.clone(), hash.clone());
        Ok(hash)
    }
}

#[async_trait]
impl BlockchainClient for SimulatedBlockchain {
    async fn mint(&self, request: MintRequest) -> Result<MintReceipt> {
        self.delay().await;
        if self.fail_mints.load(Ordering::SeqCst) {
            return Err(MarketError::BlockchainError("Mint reverted".into()));
        }
        let mut ledger = self.ledger.lock().await;
        if let Some(receipt) = ledger.mints.get(&request.idempotency_key) {
            return Ok(receipt.clone());
        }
        ledger.next_token += 1;
        let token_id = ledger.next_token.to_string();
        ledger.balances.insert(
            (token_id.clone(), request.owner_wallet.clone()),
            request.total_credits.value(),
        );
        let tx_hash = ledger.next_hash(&request.idempotency_key);
        let receipt = MintReceipt { token_id, tx_hash };
        ledger
            .mints
            .insert(request.idempotency_key, receipt.clone());
        Ok(receipt)
    }

    async fn transfer(&self, request: TransferRequest) -> Result<String> {
        self.transfer_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let remaining = self.fail_transfers.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.fail_transfers.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(MarketError::BlockchainError("Node unavailable".into()));
        }
        let mut ledger = self.ledger.lock().await;
        Self::apply_transfer(&mut ledger, &request)
    }

    async fn retire(&self, request: RetireRequest) -> Result<String> {
        self.delay().await;
        let mut ledger = self.ledger.lock().await;
        if let Some(hash) = ledger.retirements.get(&request.idempotency_key) {
            return Ok(hash.clone());
        }
        let holder = (request.token_id.clone(), request.holder.clone());
        let balance = ledger.balances.get(&holder).copied().unwrap_or_default();
        if balance < request.amount.value() {
            return Err(MarketError::BlockchainError(
                "Insufficient credits to retire".into(),
            ));
        }
        ledger
            .balances
            .insert(holder, balance - request.amount.value());
        let hash = ledger.next_hash(&request.idempotency_key);
        ledger
            .retirements
            .insert(request.idempotency_key, hash.clone());
        Ok(hash)
    }

    async fn verify_payment(&self, tx_hash: &str, amount: Money, token_id: &str) -> Result<bool> {
        self.delay().await;
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .payments
            .get(tx_hash)
            .is_some_and(|(paid, token)| *paid >= amount && token == token_id))
    }

    async fn find_transfer(&self, idempotency_key: &str) -> Result<Option<String>> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.transfers.get(idempotency_key).cloned())
    }
}

#[derive(Default)]
pub struct SimulatedGateway {
    charges: Mutex<HashMap<String, Charge>>,
    unavailable: AtomicBool,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn create_charge(&self, request: ChargeRequest) -> Result<Charge> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MarketError::PaymentError("Gateway unavailable".into()));
        }
        if request.amount_cents <= 0 {
            return Err(MarketError::PaymentError(
                "Charge amount must be positive".into(),
            ));
        }
        let mut charges = self.charges.lock().await;
        let charge = charges
            .entry(request.idempotency_key.clone())
            .or_insert_with(|| {
                let intent_id = format!("pi_{}", uuid::Uuid::new_v4().simple());
                let secret: [u8; 12] = rand::random();
                Charge {
                    client_secret: format!("{intent_id}_secret_{}", hex::encode(secret)),
                    intent_id,
                }
            });
        Ok(charge.clone())
    }
}

/// Object store with a built-in signature scanner.
pub struct SimulatedObjectStorage {
    base_url: String,
    signing_key: String,
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    scanner_down: AtomicBool,
}

impl SimulatedObjectStorage {
    pub fn new(base_url: &str, signing_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            signing_key: signing_key.to_string(),
            objects: Mutex::new(HashMap::new()),
            scanner_down: AtomicBool::new(false),
        }
    }

    pub fn set_scanner_down(&self, down: bool) {
        self.scanner_down.store(down, Ordering::SeqCst);
    }

    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        let objects = self.objects.lock().await;
        objects.get(key).map(|(bytes, _)| bytes.clone())
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ObjectStorage for SimulatedObjectStorage {
    async fn scan(&self, content: &[u8]) -> Result<ScanStatus> {
        if self.scanner_down.load(Ordering::SeqCst) {
            return Err(MarketError::SecurityError("Virus scanner unavailable".into()));
        }
        let infected = content
            .windows(EICAR_SIGNATURE.len())
            .any(|w| w == EICAR_SIGNATURE);
        if infected {
            Ok(ScanStatus::Infected("Eicar-Test-Signature".into()))
        } else {
            Ok(ScanStatus::Clean)
        }
    }

    async fn store(&self, key: &str, content: Vec<u8>, content_type: &str) -> Result<()> {
        if key.is_empty() {
            return Err(MarketError::StorageError("Empty object key".into()));
        }
        let mut objects = self.objects.lock().await;
        objects.insert(key.to_string(), (content, content_type.to_string()));
        Ok(())
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String> {
        let objects = self.objects.lock().await;
        if !objects.contains_key(key) {
            return Err(MarketError::StorageError(format!("Object {key} not found")));
        }
        let expires = chrono::Utc::now().timestamp() + expires_in.as_secs() as i64;
        let signature = hash_hex(&[
            self.signing_key.as_bytes(),
            key.as_bytes(),
            &expires.to_be_bytes(),
        ]);
        Ok(format!(
            "{}/{}?expires={}&signature={}",
            self.base_url, key, expires, signature
        ))
    }
}

/// Logs notifications instead of mailing them, keeping a copy for inspection.
#[derive(Default)]
pub struct LogNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MarketError::internal("Mail relay refused connection"));
        }
        tracing::info!(to = %notification.to, subject = %notification.subject, "notification sent");
        self.sent.lock().await.push(notification);
        Ok(())
    }
}

/// The simulated collaborators with their concrete types kept reachable, so
/// callers can flip failure switches after wiring them into `Services`.
#[derive(Clone)]
pub struct SimulatedServices {
    pub blockchain: Arc<SimulatedBlockchain>,
    pub gateway: Arc<SimulatedGateway>,
    pub storage: Arc<SimulatedObjectStorage>,
    pub notifier: Arc<LogNotifier>,
}

impl SimulatedServices {
    pub fn new(storage_base_url: &str, signing_key: &str) -> Self {
        Self {
            blockchain: Arc::new(SimulatedBlockchain::new()),
            gateway: Arc::new(SimulatedGateway::new()),
            storage: Arc::new(SimulatedObjectStorage::new(storage_base_url, signing_key)),
            notifier: Arc::new(LogNotifier::new()),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            blockchain: self.blockchain.clone(),
            gateway: self.gateway.clone(),
            storage: self.storage.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

impl Default for SimulatedServices {
    fn default() -> Self {
        Self::new("https://storage.local", "dev-signing-key")
    }
}
