//! Integration tests for the mining engine: template assembly, cooperative
//! cancellation on stale tips and the background mining loop.

mod util;

use logichain::miner::{MiningOutcome, StaleReason};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use util::test_address::{make_test_miner_address, test_address, test_key};
use util::test_chain::{
    create_test_chain, create_test_miner, create_test_pool, extend_chain, mine_next, solve,
    test_params, transfer,
};

#[test]
fn test_template_pays_subsidy_plus_fees_to_miner() {
    let chain = create_test_chain(test_params());
    let pool = create_test_pool();
    extend_chain(&chain, &test_address(1), vec![]);
    let miner = create_test_miner(chain.clone(), pool.clone());

    let sender = test_key(1);
    pool.add(transfer(&sender, &test_address(2), 5, 3, 0)).unwrap();
    pool.add(transfer(&sender, &test_address(2), 5, 2, 1)).unwrap();
    // Nonce gap; not applicable on the tip.
    pool.add(transfer(&sender, &test_address(2), 5, 9, 3)).unwrap();

    let template = miner.build_template(&make_test_miner_address()).unwrap();
    let block = &template.block;
    assert_eq!(block.index, 2);
    assert_eq!(block.previous_hash, chain.tip_hash());
    assert_eq!(block.transactions.len(), 3);
    assert_eq!(block.mining_reward, 20 + 5);
    let reward = block.reward_transaction().unwrap();
    assert_eq!(reward.to_address, make_test_miner_address());
    assert_eq!(reward.amount, 25);
    assert_eq!(template.selected.len(), 2);
    assert!(chain.check_extension(&solve(block.clone())).is_ok());
}

#[test]
fn test_template_rejects_invalid_miner_address() {
    let chain = create_test_chain(test_params());
    let miner = create_test_miner(chain, create_test_pool());
    assert!(miner.build_template("not-an-address").is_err());
}

#[tokio::test]
async fn test_solved_block_is_appended_and_pool_purged() {
    let chain = create_test_chain(test_params());
    let pool = create_test_pool();
    extend_chain(&chain, &test_address(1), vec![]);
    let miner = create_test_miner(chain.clone(), pool.clone());
    let tx = transfer(&test_key(1), &test_address(2), 10, 1, 0);
    pool.add(tx.clone()).unwrap();

    let template = miner.build_template(&make_test_miner_address()).unwrap();
    let block = miner.mine(&template, 4).unwrap().into_block().unwrap();
    assert!(block.meets_target());
    miner.submit(block.clone()).await.unwrap();

    assert_eq!(chain.tip_hash(), block.hash);
    assert!(pool.is_empty());
    assert_eq!(chain.balance_of(&test_address(2)), 10);
    assert_eq!(chain.balance_of(&make_test_miner_address()), 21);
    assert_eq!(miner.stats().blocks_mined, 1);
}

#[test]
fn test_stale_tip_stops_all_workers() {
    let chain = create_test_chain(test_params());
    let pool = create_test_pool();
    let miner = create_test_miner(chain.clone(), pool);

    let template = miner.build_template(&make_test_miner_address()).unwrap();
    // Another producer wins height 1 first.
    let winner = extend_chain(&chain, &test_address(7), vec![]);

    let outcome = miner.mine(&template, 4).unwrap();
    assert_eq!(outcome, MiningOutcome::Stale(StaleReason::TipChanged));
    assert_eq!(chain.height(), 1);
    assert_eq!(chain.tip_hash(), winner.hash);
    assert_eq!(chain.range(1, 10).len(), 1);

    let stats = miner.stats();
    assert_eq!(stats.stale_templates, 1);
    assert!(stats.total_hashes < 4 * miner.config().check_interval);
}

#[test]
fn test_tip_change_during_search_abandons_template() {
    let chain = create_test_chain(test_params());
    let miner = Arc::new(create_test_miner(chain.clone(), create_test_pool()));

    let mut template = miner.build_template(&make_test_miner_address()).unwrap();
    // Unreachable target so only the liveness check can end the search.
    template.block.difficulty = 64;
    template.block.seal().unwrap();

    let handle = {
        let miner = miner.clone();
        thread::spawn(move || miner.mine(&template, 4))
    };
    thread::sleep(Duration::from_millis(50));
    let competing = mine_next(&chain, &test_address(7), vec![]);
    chain.append(competing).unwrap();

    let started = Instant::now();
    let outcome = handle.join().unwrap().unwrap();
    assert_eq!(outcome, MiningOutcome::Stale(StaleReason::TipChanged));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(chain.height(), 1);
}

#[test]
fn test_new_pool_transaction_abandons_template_with_room() {
    let chain = create_test_chain(test_params());
    let pool = create_test_pool();
    let miner = Arc::new(create_test_miner(chain.clone(), pool.clone()));

    let mut template = miner.build_template(&make_test_miner_address()).unwrap();
    assert!(template.has_room);
    template.block.difficulty = 64;
    template.block.seal().unwrap();

    let handle = {
        let miner = miner.clone();
        thread::spawn(move || miner.mine(&template, 2))
    };
    thread::sleep(Duration::from_millis(50));
    pool.add(transfer(&test_key(3), &test_address(4), 1, 1, 0)).unwrap();

    let outcome = handle.join().unwrap().unwrap();
    assert_eq!(outcome, MiningOutcome::Stale(StaleReason::PoolChanged));
}

#[test]
fn test_cancellation_token_ends_search() {
    let chain = create_test_chain(test_params());
    let miner = Arc::new(create_test_miner(chain, create_test_pool()));
    let mut template = miner.build_template(&make_test_miner_address()).unwrap();
    template.block.difficulty = 64;
    template.block.seal().unwrap();

    let cancel = CancellationToken::new();
    let handle = {
        let miner = miner.clone();
        let cancel = cancel.clone();
        thread::spawn(move || miner.mine_until(&template, 4, &cancel))
    };
    thread::sleep(Duration::from_millis(50));
    cancel.cancel();

    assert_eq!(handle.join().unwrap().unwrap(), MiningOutcome::Cancelled);
}

#[tokio::test]
async fn test_run_loop_extends_chain_until_shutdown() {
    let chain = create_test_chain(test_params());
    let miner = Arc::new(create_test_miner(chain.clone(), create_test_pool()));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(miner.clone().run(shutdown.clone()));

    let reached = tokio::time::timeout(Duration::from_secs(20), async {
        while chain.height() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    shutdown.cancel();
    task.await.unwrap();

    assert!(reached.is_ok(), "miner did not reach height 3");
    let blocks = chain.range(0, usize::MAX);
    for pair in blocks.windows(2) {
        assert_eq!(pair[1].previous_hash, pair[0].hash);
    }
    assert!(miner.stats().blocks_mined >= 3);
    assert_eq!(
        chain.balance_of(&make_test_miner_address()),
        20 * chain.height()
    );
}
