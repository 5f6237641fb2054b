use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use ciphermed_confidential::{generate_key_pair, KeyPair, PatientRecord};
use ciphermed_ledger::{
    accounts::{
        ComputationAccount, ComputationDefinitionAccount, ComputationStatus, MxeAccount,
        PatientDataAccount, RecordProgramInstruction, X25519_PUBLIC_KEY_SIZE,
    },
    events::{ComputationQueuedEvent, PatientDataStoredEvent},
    pda,
    types::{from_cbor, to_cbor, Address, Instruction, ProgramId},
    Commitment, ComputationOffset, EventBus, LedgerError, LedgerEvent, LedgerEventIdentifier,
    LedgerService, ListenerId, Signature,
};
use sha2::{Digest, Sha256};

use crate::{
    bus::ListenerRegistry,
    cluster::{ClusterBehavior, LookupJob, SimulatedCluster},
};

/// Label the default program id is derived from
pub const DEFAULT_PROGRAM_LABEL: &str = "ciphermed/medical-record-program";

/// Cluster offset used when none is configured
pub const DEFAULT_CLUSTER_OFFSET: u32 = 1_116_522_165;

type Accounts = HashMap<Address, Vec<u8>>;

struct LedgerState {
    accounts: Accounts,
    /// Reads of the MXE account so far
    mxe_reads: u32,
    /// Transactions accepted so far
    transactions: u64,
}

struct Inner {
    program_id: ProgramId,
    cluster_offset: u32,
    /// The MXE key is published once the MXE account has been read this many times
    publish_mxe_key_after: u32,
    execution_delay: Duration,
    duplicate_result_events: usize,
    cluster: SimulatedCluster,
    state: Mutex<LedgerState>,
    bus: ListenerRegistry,
}

/// An in-process ledger with a simulated computation cluster.
///
/// Implements [`LedgerService`] and [`EventBus`]; cheap to clone, all clones
/// share one ledger. Queued computations execute on a spawned tokio task, so
/// transactions must be submitted from within a runtime.
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<Inner>,
}

/// Effects of a transaction applied only once every instruction succeeded.
#[derive(Default)]
struct Effects {
    events: Vec<LedgerEvent>,
    jobs: Vec<LookupJob>,
}

impl LocalNetwork {
    #[must_use]
    pub fn builder() -> Builder {
        Builder::new()
    }

    #[must_use]
    pub fn program_id(&self) -> ProgramId {
        self.inner.program_id
    }

    #[must_use]
    pub fn cluster_offset(&self) -> u32 {
        self.inner.cluster_offset
    }

    /// The cluster's X25519 public key, whether or not it is published yet.
    #[must_use]
    pub fn mxe_public_key(&self) -> [u8; X25519_PUBLIC_KEY_SIZE] {
        self.inner.cluster.public_key()
    }

    /// Number of registered event listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.bus.len()
    }

    /// Number of transactions accepted so far.
    #[must_use]
    pub fn transaction_count(&self) -> u64 {
        self.inner.lock_state().transactions
    }

    /// Raw state of an account, bypassing MXE publication.
    #[must_use]
    pub fn account(&self, address: &Address) -> Option<Vec<u8>> {
        self.inner.lock_state().accounts.get(address).cloned()
    }

    /// Status of the computation queued under `offset`, if any.
    #[must_use]
    pub fn computation_status(&self, offset: ComputationOffset) -> Option<ComputationStatus> {
        let address = pda::computation_address(self.inner.cluster_offset, offset);
        self.account(&address)
            .and_then(|bytes| from_cbor::<ComputationAccount>(&bytes).ok())
            .map(|account| account.status)
    }

    /// Publishes an arbitrary event, as if emitted by the program. Returns how
    /// many listeners accepted it.
    pub fn publish_event(&self, event: &LedgerEvent) -> usize {
        self.inner.bus.publish(event)
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_signature(state: &mut LedgerState) -> Signature {
        state.transactions += 1;
        let digest = Sha256::digest(state.transactions.to_le_bytes());
        Signature::new(hex::encode(digest))
    }

    fn apply(
        &self,
        accounts: &mut Accounts,
        effects: &mut Effects,
        instruction: &Instruction,
        signers: &[Address],
    ) -> Result<(), String> {
        if instruction.program_id != self.program_id {
            return Err(format!("unknown program {}", instruction.program_id));
        }
        let payer = instruction
            .accounts
            .first()
            .filter(|meta| meta.is_signer && signers.contains(&meta.address))
            .map(|meta| meta.address)
            .ok_or_else(|| "missing payer signature".to_string())?;
        let decoded: RecordProgramInstruction =
            from_cbor(&instruction.data).map_err(|e| format!("invalid instruction data: {e}"))?;

        match decoded {
            RecordProgramInstruction::StorePatientData { ciphertexts } => {
                if ciphertexts.len() != PatientRecord::SCHEMA.len() {
                    return Err(format!(
                        "patient data must have {} fields, got {}",
                        PatientRecord::SCHEMA.len(),
                        ciphertexts.len()
                    ));
                }
                let account = pda::patient_data_address(&self.program_id, &payer);
                if accounts.contains_key(&account) {
                    return Err(format!("patient data for {payer} already stored"));
                }
                put(accounts, account, &PatientDataAccount { owner: payer, ciphertexts })?;
                effects.events.push(event(
                    LedgerEventIdentifier::PatientDataStoredEvent,
                    &PatientDataStoredEvent { owner: payer, account },
                )?);
            }
            RecordProgramInstruction::InitComputationDefinition { name, offset } => {
                if offset != pda::computation_definition_offset(&name) {
                    return Err(format!("offset {offset} does not match definition `{name}`"));
                }
                let address = pda::computation_definition_address(&self.program_id, offset);
                if accounts.contains_key(&address) {
                    return Err(format!("computation definition `{name}` already initialized"));
                }
                put(
                    accounts,
                    address,
                    &ComputationDefinitionAccount {
                        name,
                        offset,
                        finalized: false,
                    },
                )?;
            }
            RecordProgramInstruction::FinalizeComputationDefinition { offset } => {
                let address = pda::computation_definition_address(&self.program_id, offset);
                let mut definition: ComputationDefinitionAccount = get(accounts, &address)?
                    .ok_or_else(|| format!("computation definition {offset} not initialized"))?;
                if definition.finalized {
                    return Err(format!(
                        "computation definition `{}` already finalized",
                        definition.name
                    ));
                }
                definition.finalized = true;
                put(accounts, address, &definition)?;
            }
            RecordProgramInstruction::PrivateRecordLookup {
                computation_offset,
                receiver,
                receiver_nonce,
                sender_public_key,
                nonce,
            } => {
                let definition_offset =
                    pda::computation_definition_offset(pda::PRIVATE_RECORD_LOOKUP);
                let definition: ComputationDefinitionAccount = get(
                    accounts,
                    &pda::computation_definition_address(&self.program_id, definition_offset),
                )?
                .ok_or_else(|| "computation definition not initialized".to_string())?;
                if !definition.finalized {
                    return Err("computation definition not finalized".to_string());
                }
                let mxe: MxeAccount = get(accounts, &pda::mxe_address(&self.program_id))?
                    .unwrap_or_default();
                if mxe.x25519_public_key.is_none() {
                    return Err("MXE key not published".to_string());
                }
                let computation_address =
                    pda::computation_address(self.cluster_offset, computation_offset);
                if accounts.contains_key(&computation_address) {
                    return Err(format!("computation offset {computation_offset} already in use"));
                }
                let record: PatientDataAccount =
                    get(accounts, &pda::patient_data_address(&self.program_id, &payer))?
                        .ok_or_else(|| format!("no patient data stored for {payer}"))?;
                put(
                    accounts,
                    computation_address,
                    &ComputationAccount {
                        offset: computation_offset,
                        definition_offset,
                        status: ComputationStatus::Queued,
                    },
                )?;
                effects.events.push(event(
                    LedgerEventIdentifier::ComputationQueuedEvent,
                    &ComputationQueuedEvent {
                        offset: computation_offset,
                        computation_account: computation_address,
                    },
                )?);
                effects.jobs.push(LookupJob {
                    offset: computation_offset,
                    sender_public_key,
                    sender_nonce: nonce,
                    receiver_public_key: receiver,
                    receiver_nonce,
                    stored: record.ciphertexts,
                });
            }
        }
        Ok(())
    }

    fn set_status(&self, offset: ComputationOffset, status: ComputationStatus) {
        let address = pda::computation_address(self.cluster_offset, offset);
        let mut state = self.lock_state();
        let Ok(Some(mut account)) = get::<ComputationAccount>(&state.accounts, &address) else {
            return;
        };
        account.status = status;
        if let Err(e) = put(&mut state.accounts, address, &account) {
            tracing::error!(
                target = "ciphermed-localnet",
                event = "computation_status_update_failed",
                offset = %offset,
                error = %e,
                "Failed to update computation status"
            );
        }
    }

    /// Runs one queued lookup on the simulated cluster.
    async fn execute(self: Arc<Self>, job: LookupJob) {
        if self.cluster.behavior() == &ClusterBehavior::Stall {
            tracing::debug!(
                target = "ciphermed-localnet",
                event = "computation_stalled",
                offset = %job.offset,
                "Cluster stalled, computation stays queued"
            );
            return;
        }
        tokio::time::sleep(self.execution_delay).await;
        self.set_status(job.offset, ComputationStatus::Executing);

        if let ClusterBehavior::Fail(reason) = self.cluster.behavior() {
            self.set_status(
                job.offset,
                ComputationStatus::Failed {
                    reason: reason.clone(),
                },
            );
            return;
        }

        let result = self
            .cluster
            .execute(&job)
            .map_err(|e| e.to_string())
            .and_then(|payload| {
                event(
                    LedgerEventIdentifier::ReceivedPrivateRecordLookupEvent,
                    &payload,
                )
            });
        match result {
            Ok(result_event) => {
                // result events precede the Finalized status
                for _ in 0..=self.duplicate_result_events {
                    self.bus.publish(&result_event);
                }
                let signature = Self::next_signature(&mut self.lock_state());
                self.set_status(job.offset, ComputationStatus::Finalized { signature });
                tracing::info!(
                    target = "ciphermed-localnet",
                    event = "computation_finalized",
                    offset = %job.offset,
                    "Cluster finalized computation"
                );
            }
            Err(reason) => {
                tracing::warn!(
                    target = "ciphermed-localnet",
                    event = "computation_failed",
                    offset = %job.offset,
                    reason = %reason,
                    "Cluster failed to execute computation"
                );
                self.set_status(job.offset, ComputationStatus::Failed { reason });
            }
        }
    }
}

fn get<T: serde::de::DeserializeOwned>(
    accounts: &Accounts,
    address: &Address,
) -> Result<Option<T>, String> {
    accounts
        .get(address)
        .map(|bytes| from_cbor(bytes).map_err(|e| format!("corrupt account {address}: {e}")))
        .transpose()
}

fn put<T: serde::Serialize>(accounts: &mut Accounts, address: Address, value: &T) -> Result<(), String> {
    let bytes = to_cbor(value).map_err(|e| e.to_string())?;
    accounts.insert(address, bytes);
    Ok(())
}

fn event<T: serde::Serialize>(
    identifier: LedgerEventIdentifier,
    payload: &T,
) -> Result<LedgerEvent, String> {
    LedgerEvent::new(identifier, payload).map_err(|e| e.to_string())
}

#[async_trait]
impl LedgerService for LocalNetwork {
    async fn submit_transaction(
        &self,
        instructions: Vec<Instruction>,
        signers: &[Address],
    ) -> Result<Signature, LedgerError> {
        if signers.is_empty() {
            return Err(LedgerError::Rejected("transaction has no signers".to_string()));
        }
        let (signature, effects) = {
            let mut state = self.inner.lock_state();
            let mut staged = state.accounts.clone();
            let mut effects = Effects::default();
            for instruction in &instructions {
                self.inner
                    .apply(&mut staged, &mut effects, instruction, signers)
                    .map_err(|reason| {
                        tracing::debug!(
                            target = "ciphermed-localnet",
                            event = "transaction_rejected",
                            reason = %reason,
                            "Rejected transaction"
                        );
                        LedgerError::Rejected(reason)
                    })?;
            }
            state.accounts = staged;
            (Inner::next_signature(&mut state), effects)
        };

        for event in &effects.events {
            self.inner.bus.publish(event);
        }
        for job in effects.jobs {
            tokio::spawn(Arc::clone(&self.inner).execute(job));
        }
        Ok(signature)
    }

    async fn get_account_state(
        &self,
        address: &Address,
        _commitment: Commitment,
    ) -> Result<Option<Vec<u8>>, LedgerError> {
        let mut state = self.inner.lock_state();
        if *address == pda::mxe_address(&self.inner.program_id) {
            state.mxe_reads += 1;
            if state.mxe_reads >= self.inner.publish_mxe_key_after {
                let published = MxeAccount {
                    x25519_public_key: Some(self.inner.cluster.public_key()),
                    cluster_offset: Some(self.inner.cluster_offset),
                };
                put(&mut state.accounts, *address, &published).map_err(LedgerError::Unavailable)?;
            }
        }
        Ok(state.accounts.get(address).cloned())
    }
}

impl EventBus for LocalNetwork {
    fn add_listener(&self, event_name: &str, sender: flume::Sender<LedgerEvent>) -> ListenerId {
        self.inner.bus.add_listener(event_name, sender)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.bus.remove_listener(id)
    }
}

/// Builder for [`LocalNetwork`].
pub struct Builder {
    program_id: Option<ProgramId>,
    cluster_offset: Option<u32>,
    mxe_keypair: Option<KeyPair>,
    publish_mxe_key_after: u32,
    cluster_behavior: ClusterBehavior,
    execution_delay: Duration,
    duplicate_result_events: usize,
    tamper_output: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            program_id: None,
            cluster_offset: None,
            mxe_keypair: None,
            publish_mxe_key_after: 0,
            cluster_behavior: ClusterBehavior::Finalize,
            execution_delay: Duration::from_millis(10),
            duplicate_result_events: 0,
            tamper_output: false,
        }
    }

    #[must_use]
    pub const fn program_id(mut self, program_id: ProgramId) -> Self {
        self.program_id = Some(program_id);
        self
    }

    #[must_use]
    pub const fn cluster_offset(mut self, cluster_offset: u32) -> Self {
        self.cluster_offset = Some(cluster_offset);
        self
    }

    #[must_use]
    pub fn mxe_keypair(mut self, keypair: KeyPair) -> Self {
        self.mxe_keypair = Some(keypair);
        self
    }

    /// Keeps the MXE key unpublished until the MXE account has been read
    /// `reads` times; `0` publishes it from the start.
    #[must_use]
    pub const fn publish_mxe_key_after(mut self, reads: u32) -> Self {
        self.publish_mxe_key_after = reads;
        self
    }

    #[must_use]
    pub fn cluster_behavior(mut self, behavior: ClusterBehavior) -> Self {
        self.cluster_behavior = behavior;
        self
    }

    /// Time the cluster takes to pick up a queued computation.
    #[must_use]
    pub const fn execution_delay(mut self, delay: Duration) -> Self {
        self.execution_delay = delay;
        self
    }

    /// Emits every result event `count` more times.
    #[must_use]
    pub const fn duplicate_result_events(mut self, count: usize) -> Self {
        self.duplicate_result_events = count;
        self
    }

    /// Flips a bit in every result the cluster produces.
    #[must_use]
    pub const fn tamper_output(mut self, tamper: bool) -> Self {
        self.tamper_output = tamper;
        self
    }

    /// Builds the network with an empty ledger except for the MXE account.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Unavailable` if the MXE account cannot be encoded.
    pub fn build(self) -> Result<LocalNetwork, LedgerError> {
        let program_id = self
            .program_id
            .unwrap_or_else(|| Address::from_label(DEFAULT_PROGRAM_LABEL));
        let cluster_offset = self.cluster_offset.unwrap_or(DEFAULT_CLUSTER_OFFSET);
        let cluster = SimulatedCluster::new(
            self.mxe_keypair.unwrap_or_else(generate_key_pair),
            self.cluster_behavior,
            self.tamper_output,
        );

        let mut accounts = Accounts::new();
        let mxe = MxeAccount {
            x25519_public_key: (self.publish_mxe_key_after == 0).then(|| cluster.public_key()),
            cluster_offset: Some(cluster_offset),
        };
        put(&mut accounts, pda::mxe_address(&program_id), &mxe).map_err(LedgerError::Unavailable)?;

        tracing::info!(
            target = "ciphermed-localnet",
            event = "local_network_started",
            program_id = %program_id,
            cluster_offset = cluster_offset,
            mxe_public_key = %hex::encode(cluster.public_key()),
            "Started local network"
        );
        Ok(LocalNetwork {
            inner: Arc::new(Inner {
                program_id,
                cluster_offset,
                publish_mxe_key_after: self.publish_mxe_key_after,
                execution_delay: self.execution_delay,
                duplicate_result_events: self.duplicate_result_events,
                cluster,
                state: Mutex::new(LedgerState {
                    accounts,
                    mxe_reads: 0,
                    transactions: 0,
                }),
                bus: ListenerRegistry::new(),
            }),
        })
    }
}
