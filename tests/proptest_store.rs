//! Property tests for credit accounting.
//!
//! 1. No over-spend: however deductions interleave, the sum of successful
//!    charges never exceeds the funds that ever entered the key.
//! 2. Conservation: `credits + total_spent` equals the initial allocation
//!    plus top-ups, across any mix of deductions, top-ups, and refunds.

use std::sync::Arc;

use proptest::prelude::*;

use paygate::keys::{CreditLedger, DeductOutcome, KeyConfig, KeyStore, LedgerEntryType};

#[derive(Debug, Clone)]
enum Op {
    Deduct(u64),
    Topup(u64),
    RefundLast,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..60).prop_map(Op::Deduct),
        (1u64..40).prop_map(Op::Topup),
        Just(Op::RefundLast),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn deductions_never_overspend(
        initial in 0u64..500,
        amounts in proptest::collection::vec(1u64..60, 1..40),
    ) {
        runtime().block_on(async {
            let store = KeyStore::new(Arc::new(CreditLedger::default()), None, 0);
            let key = store.create("p", initial, KeyConfig::default()).await.unwrap().key;

            let mut charged = 0u64;
            for amount in &amounts {
                if let DeductOutcome::Charged { .. } =
                    store.deduct_credits(&key, *amount, "t").await.unwrap()
                {
                    charged += amount;
                }
            }

            let record = store.get(&key).await.unwrap();
            prop_assert!(charged <= initial);
            prop_assert_eq!(record.credits, initial - charged);
            prop_assert_eq!(record.total_spent, charged);
            Ok(())
        })?;
    }

    #[test]
    fn credits_plus_spent_is_conserved(
        initial in 0u64..300,
        ops in proptest::collection::vec(op_strategy(), 1..50),
    ) {
        runtime().block_on(async {
            let store = KeyStore::new(Arc::new(CreditLedger::default()), None, 0);
            let key = store.create("p", initial, KeyConfig::default()).await.unwrap().key;

            let mut inflow = initial;
            let mut last_charge: Option<u64> = None;
            let mut last_calls = 0u64;

            for op in &ops {
                match op {
                    Op::Deduct(amount) => {
                        if let DeductOutcome::Charged { .. } =
                            store.deduct_credits(&key, *amount, "t").await.unwrap()
                        {
                            last_charge = Some(*amount);
                        }
                    }
                    Op::Topup(amount) => {
                        store
                            .add_credits(&key, *amount, LedgerEntryType::Topup, None)
                            .await
                            .unwrap();
                        inflow += amount;
                    }
                    Op::RefundLast => {
                        // Refund the most recent un-refunded charge, if any.
                        if let Some(amount) = last_charge.take() {
                            store.refund(&key, amount, "t").await.unwrap();
                        }
                    }
                }

                let record = store.get(&key).await.unwrap();
                // Conservation: every credit is either spendable or spent.
                prop_assert_eq!(record.credits + record.total_spent, inflow);
                // Call counters never move backwards.
                prop_assert!(record.total_calls >= last_calls);
                last_calls = record.total_calls;
            }
            Ok(())
        })?;
    }
}
