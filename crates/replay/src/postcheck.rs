//! Post-execution state assertions.
//!
//! Contracts are compared absolutely. Sender balances cannot be, because live wallets
//! start from arbitrary balances and pay live fees, so the fixture's balance change is
//! compared with the observed change after swapping the fixture gas cost for the gas cost
//! actually paid.

use crate::{AddressMap, Client};
use alloy_primitives::{I256, U256};
use payload::{parse_b256, parse_u256, Payload, Placeholder, PostCheck};
use std::collections::BTreeMap;
use thiserror::Error;

/// Gas paid by one sender across its phases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SenderGasCosts {
    /// Gas used priced at the fixture gas price.
    pub fixture: U256,
    /// Gas used priced at the live fee cap.
    pub actual: U256,
}

impl SenderGasCosts {
    /// Adds one confirmed transaction.
    pub fn record(&mut self, gas_used: u64, fixture_gas_price: u64, live_fee_cap: u128) {
        let gas_used = U256::from(gas_used);
        self.fixture += gas_used * U256::from(fixture_gas_price);
        self.actual += gas_used * U256::from(live_fee_cap);
    }
}

/// Outcome of a relative sender balance comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BalanceReconciliation {
    /// `prereq - expected` from the fixture.
    pub expected_change: I256,
    /// Expected change with the fixture gas cost swapped for the live one.
    pub adjusted_change: I256,
    /// `initial - final` as observed.
    pub actual_change: I256,
}

impl BalanceReconciliation {
    /// Absolute difference between observed and adjusted change.
    pub fn diff(&self) -> U256 {
        self.actual_change
            .saturating_sub(self.adjusted_change)
            .unsigned_abs()
    }

    /// Whether the observed change matches exactly.
    pub fn matches(&self) -> bool {
        self.actual_change == self.adjusted_change
    }
}

/// Balance arithmetic left the signed 256-bit range.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// Input does not fit a signed 256-bit word.
    #[error("{name} {value} is out of range")]
    OutOfRange {
        /// Which input.
        name: &'static str,
        /// Offending value.
        value: U256,
    },
    /// Intermediate change overflowed.
    #[error("{0} overflowed")]
    Overflow(&'static str),
}

fn signed(name: &'static str, value: U256) -> Result<I256, ReconcileError> {
    I256::try_from(value).map_err(|_| ReconcileError::OutOfRange { name, value })
}

fn sub(name: &'static str, a: I256, b: I256) -> Result<I256, ReconcileError> {
    a.checked_sub(b).ok_or(ReconcileError::Overflow(name))
}

/// Compares a sender's observed balance change with the fixture's, after replacing the
/// fixture gas cost with the live one.
pub fn reconcile_sender_balance(
    prereq: U256,
    expected: U256,
    initial: U256,
    final_balance: U256,
    costs: SenderGasCosts,
) -> Result<BalanceReconciliation, ReconcileError> {
    let expected_change = sub(
        "expected change",
        signed("prerequisite balance", prereq)?,
        signed("expected balance", expected)?,
    )?;
    let adjusted_change = sub(
        "adjusted change",
        expected_change,
        signed("fixture gas cost", costs.fixture)?,
    )?
    .checked_add(signed("actual gas cost", costs.actual)?)
    .ok_or(ReconcileError::Overflow("adjusted change"))?;
    let actual_change = sub(
        "actual change",
        signed("initial balance", initial)?,
        signed("final balance", final_balance)?,
    )?;
    Ok(BalanceReconciliation {
        expected_change,
        adjusted_change,
        actual_change,
    })
}

/// Chain state observed before the first phase and gas paid during the phases.
#[derive(Clone, Debug, Default)]
pub struct ExecutionLedger {
    /// Sender balances before the first phase, by sender index.
    pub initial_balances: BTreeMap<usize, U256>,
    /// Gas costs by sender index.
    pub gas_costs: BTreeMap<usize, SenderGasCosts>,
}

/// Checks the post-state of one execution.
#[derive(Debug)]
pub struct PostCheckValidator<'a> {
    client: &'a Client,
    addresses: &'a AddressMap,
}

impl<'a> PostCheckValidator<'a> {
    /// Creates a validator reading state through `client`.
    pub fn new(client: &'a Client, addresses: &'a AddressMap) -> Self {
        Self { client, addresses }
    }

    /// Checks every post-check target in key order and returns all mismatches.
    pub async fn validate(&self, payload: &Payload, ledger: &ExecutionLedger) -> Vec<String> {
        let mut failures = Vec::new();
        for (key, check) in &payload.postcheck {
            let target = match key.parse::<Placeholder>() {
                Ok(placeholder) => placeholder,
                Err(_) if key.starts_with("contract[") => {
                    failures.push(format!("{key}: unknown contract"));
                    continue;
                }
                Err(_) if key.starts_with("sender[") => {
                    failures.push(format!("{key}: unknown sender"));
                    continue;
                }
                Err(_) => {
                    failures.push(format!("{key}: unknown address type"));
                    continue;
                }
            };
            if self.addresses.resolve(target).is_none() {
                let kind = match target {
                    Placeholder::Contract(_) => "contract",
                    Placeholder::Sender(_) => "sender",
                };
                failures.push(format!("{key}: unknown {kind}"));
                continue;
            }
            self.check_storage(key, target, check, &mut failures).await;
            self.check_balance(key, target, check, payload, ledger, &mut failures)
                .await;
        }
        failures
    }

    async fn check_storage(
        &self,
        key: &str,
        target: Placeholder,
        check: &PostCheck,
        failures: &mut Vec<String>,
    ) {
        let Some(address) = self.addresses.resolve(target) else {
            return;
        };
        for (slot, expected) in &check.storage {
            let slot_key = match parse_b256(slot) {
                Ok(slot_key) => slot_key,
                Err(error) => {
                    failures.push(format!("{key} storage[{slot}]: invalid slot: {error}"));
                    continue;
                }
            };
            let expected = match self.addresses.substitute(expected) {
                Ok(expected) => expected,
                Err(error) => {
                    failures.push(format!(
                        "{key} storage[{slot}]: failed to replace placeholders: {error}"
                    ));
                    continue;
                }
            };
            let expected = match parse_b256(&expected) {
                Ok(expected) => expected,
                Err(error) => {
                    failures.push(format!("{key} storage[{slot}]: {error}"));
                    continue;
                }
            };
            match self
                .client
                .chain()
                .storage_at(address, U256::from_be_bytes(slot_key.0))
                .await
            {
                Ok(actual) if actual == expected => {}
                Ok(actual) => failures.push(format!(
                    "{key} storage[{slot}]: expected {expected}, got {actual}"
                )),
                Err(error) => failures.push(format!(
                    "{key} storage[{slot}]: failed to get storage: {error}"
                )),
            }
        }
    }

    async fn check_balance(
        &self,
        key: &str,
        target: Placeholder,
        check: &PostCheck,
        payload: &Payload,
        ledger: &ExecutionLedger,
        failures: &mut Vec<String>,
    ) {
        if check.balance.is_empty() {
            return;
        }
        let Ok(expected) = parse_u256(&check.balance) else {
            failures.push(format!(
                "{key} balance: failed to parse expected balance: {}",
                check.balance
            ));
            return;
        };
        let Some(address) = self.addresses.resolve(target) else {
            return;
        };

        let index = match target {
            Placeholder::Sender(index) => index,
            Placeholder::Contract(_) => {
                match self.client.chain().balance(address).await {
                    Ok(actual) if actual == expected => {}
                    Ok(actual) => {
                        failures.push(format!("{key} balance: expected {expected}, got {actual}"))
                    }
                    Err(error) => {
                        failures.push(format!("{key} balance: failed to get balance: {error}"))
                    }
                }
                return;
            }
        };

        let Some(initial) = ledger.initial_balances.get(&index).copied() else {
            failures.push(format!("{key} balance: no initial balance recorded"));
            return;
        };
        let Some(prereq) = payload.prerequisites.get(&target.to_string()) else {
            return;
        };
        let Ok(prereq) = parse_u256(prereq) else {
            failures.push(format!("{key} balance: failed to parse prerequisite balance"));
            return;
        };
        let final_balance = match self.client.chain().balance(address).await {
            Ok(balance) => balance,
            Err(error) => {
                failures.push(format!("{key} balance: failed to get balance: {error}"));
                return;
            }
        };

        let costs = ledger.gas_costs.get(&index).copied().unwrap_or_default();
        let reconciliation =
            match reconcile_sender_balance(prereq, expected, initial, final_balance, costs) {
                Ok(reconciliation) => reconciliation,
                Err(error) => {
                    failures.push(format!("{key} balance: {error}"));
                    return;
                }
            };
        if !reconciliation.matches() {
            failures.push(format!(
                "{key} balance: expected change {} (adjusted from {}), got {} (diff: {})",
                reconciliation.adjusted_change,
                reconciliation.expected_change,
                reconciliation.actual_change,
                reconciliation.diff()
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{test_client, MockChain};
    use alloy_primitives::{address, B256};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn setup() -> (Arc<MockChain>, Arc<Client>, AddressMap, Payload) {
        let chain = Arc::new(MockChain::new(1));
        let client = test_client(&chain);
        let deployer = address!("0x1000000000000000000000000000000000000001");
        let sender = address!("0x2000000000000000000000000000000000000002");
        let payload: Payload = serde_yaml::from_str(
            r#"
name: checks
prerequisites:
  sender[1]: "0x3e8"
txs:
  - from: deployer
    type: 2
postcheck:
  contract[1]:
    balance: "0x05"
    storage:
      "0x01": "0x2a"
      "0x02": "0x$sender[1]"
  sender[1]:
    balance: "0x384"
"#,
        )
        .unwrap();
        let addresses = AddressMap::new(deployer, 0, vec![sender], &payload);
        (chain, client, addresses, payload)
    }

    fn ledger(initial: u64, costs: SenderGasCosts) -> ExecutionLedger {
        ExecutionLedger {
            initial_balances: BTreeMap::from([(1, U256::from(initial))]),
            gas_costs: BTreeMap::from([(1, costs)]),
        }
    }

    #[tokio::test]
    async fn all_checks_pass() {
        let (chain, client, addresses, payload) = setup();
        let contract = addresses.contract(1).unwrap();
        let sender = addresses.sender(1).unwrap();
        chain.fund(contract, U256::from(5));
        chain.set_storage(contract, U256::from(1), B256::with_last_byte(0x2a));
        chain.set_storage(contract, U256::from(2), sender.into_word());
        // Fixture spent 100, of which 40 gas. Live gas cost 70, so 130 is expected.
        chain.fund(sender, U256::from(10_000 - 130));
        let costs = SenderGasCosts {
            fixture: U256::from(40),
            actual: U256::from(70),
        };

        let failures = PostCheckValidator::new(&client, &addresses)
            .validate(&payload, &ledger(10_000, costs))
            .await;
        assert_eq!(failures, Vec::<String>::new());
    }

    #[tokio::test]
    async fn mismatches_are_collected() {
        let (chain, client, addresses, payload) = setup();
        let contract = addresses.contract(1).unwrap();
        let sender = addresses.sender(1).unwrap();
        chain.fund(contract, U256::from(6));
        chain.fund(sender, U256::from(10_000 - 120));

        let failures = PostCheckValidator::new(&client, &addresses)
            .validate(&payload, &ledger(10_000, SenderGasCosts::default()))
            .await;
        assert_eq!(
            failures,
            vec![
                format!(
                    "contract[1] storage[0x01]: expected {}, got {}",
                    B256::with_last_byte(0x2a),
                    B256::ZERO
                ),
                format!(
                    "contract[1] storage[0x02]: expected {}, got {}",
                    sender.into_word(),
                    B256::ZERO
                ),
                "contract[1] balance: expected 5, got 6".to_string(),
                "sender[1] balance: expected change 100 (adjusted from 100), got 120 (diff: 20)"
                    .to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_targets() {
        let (_chain, client, addresses, mut payload) = setup();
        payload.postcheck = [
            ("contract[9]", PostCheck::default()),
            ("sender[4]", PostCheck::default()),
            ("0x1234", PostCheck::default()),
        ]
        .into_iter()
        .map(|(key, check)| (key.to_string(), check))
        .collect();

        let failures = PostCheckValidator::new(&client, &addresses)
            .validate(&payload, &ExecutionLedger::default())
            .await;
        assert_eq!(
            failures,
            vec![
                "0x1234: unknown address type",
                "contract[9]: unknown contract",
                "sender[4]: unknown sender",
            ]
        );
    }

    #[tokio::test]
    async fn sender_without_prerequisite_is_skipped() {
        let (chain, client, addresses, mut payload) = setup();
        payload.prerequisites.clear();
        payload.postcheck.retain(|key, _| key.starts_with("sender"));
        chain.fund(addresses.sender(1).unwrap(), U256::from(1));

        let failures = PostCheckValidator::new(&client, &addresses)
            .validate(&payload, &ledger(10_000, SenderGasCosts::default()))
            .await;
        assert!(failures.is_empty());
    }

    #[test]
    fn gas_costs_accumulate() {
        let mut costs = SenderGasCosts::default();
        costs.record(21_000, 10, 30);
        costs.record(50_000, 10, 30);
        assert_eq!(costs.fixture, U256::from(710_000));
        assert_eq!(costs.actual, U256::from(2_130_000));
    }

    #[test]
    fn negative_changes() {
        // The sender received more than it spent.
        let result = reconcile_sender_balance(
            U256::from(100),
            U256::from(150),
            U256::from(1_000),
            U256::from(1_050),
            SenderGasCosts::default(),
        )
        .unwrap();
        assert!(result.matches());
        assert_eq!(result.expected_change, I256::try_from(-50i64).unwrap());
        assert_eq!(result.diff(), U256::ZERO);
    }

    #[test]
    fn balances_beyond_signed_range_are_rejected() {
        let huge = U256::from(1) << 255;
        assert_eq!(
            reconcile_sender_balance(
                huge,
                U256::ZERO,
                U256::from(1_000),
                U256::from(900),
                SenderGasCosts::default(),
            ),
            Err(ReconcileError::OutOfRange {
                name: "prerequisite balance",
                value: huge,
            })
        );

        let max = U256::from(I256::MAX.into_raw());
        assert_eq!(
            reconcile_sender_balance(
                max,
                U256::ZERO,
                U256::ZERO,
                U256::ZERO,
                SenderGasCosts {
                    fixture: U256::ZERO,
                    actual: U256::from(1),
                },
            ),
            Err(ReconcileError::Overflow("adjusted change"))
        );
    }

    proptest! {
        #[test]
        fn identity_without_fee_change(
            prereq in any::<u128>(),
            spent in any::<u64>(),
            initial in any::<u128>(),
            gas in any::<u64>(),
        ) {
            let expected = U256::from(prereq).saturating_sub(U256::from(spent));
            let change = U256::from(prereq) - expected;
            prop_assume!(U256::from(initial) >= change);
            let final_balance = U256::from(initial) - change;

            let costs = SenderGasCosts { fixture: U256::from(gas), actual: U256::from(gas) };
            let result = reconcile_sender_balance(
                U256::from(prereq),
                expected,
                U256::from(initial),
                final_balance,
                costs,
            )
            .unwrap();
            prop_assert!(result.matches());
            prop_assert_eq!(result.actual_change, result.expected_change);
            prop_assert_eq!(result.diff(), U256::ZERO);
        }

        #[test]
        fn diff_is_symmetric_distance(
            adjusted in any::<u64>(),
            actual in any::<u64>(),
        ) {
            let result = reconcile_sender_balance(
                U256::from(adjusted),
                U256::ZERO,
                U256::from(actual),
                U256::ZERO,
                SenderGasCosts::default(),
            )
            .unwrap();
            prop_assert_eq!(result.diff(), U256::from(adjusted.abs_diff(actual)));
        }
    }
}
