use std::collections::HashSet;

use proptest::prelude::*;
use toml::Value;

use exprun::config::ConfigFile;
use exprun::expand::{expand_tests, CompletionIndex};
use exprun::render::{assign_hosts, partition_sizes};
use exprun_test_utils::builders::{matrix_value, ConfigFileBuilder, TestSetBuilder};

// One test set with up to three dimensions of up to three values each.
// Value ids are distinct within a dimension so ids never collide.
fn matrix_config_strategy() -> impl Strategy<Value = (ConfigFile, Vec<usize>, u32, u32)> {
    (
        proptest::collection::vec(1..=3usize, 0..=3),
        1..=12u32,
        0..=4u32,
    )
        .prop_map(|(dimension_sizes, replicas, completed)| {
            let mut test = TestSetBuilder::new("p", "exp")
                .replicas(replicas)
                .completed(completed);
            for (d, size) in dimension_sizes.iter().enumerate() {
                let values = (0..*size)
                    .map(|v| matrix_value(&format!("d{d}v{v}"), &[("V", Value::Integer(v as i64))]))
                    .collect();
                test = test.dimension(&format!("dim{d}"), values);
            }
            let cfg = ConfigFileBuilder::new().with_test(test.build()).build();
            (cfg, dimension_sizes, replicas, completed)
        })
}

proptest! {
    #[test]
    fn partition_covers_every_host_and_stays_balanced(hosts in 0..200usize, fields in 1..20usize) {
        let sizes = partition_sizes(hosts, fields);

        prop_assert_eq!(sizes.len(), fields);
        prop_assert_eq!(sizes.iter().sum::<usize>(), hosts);
        let max = *sizes.iter().max().unwrap();
        let min = *sizes.iter().min().unwrap();
        prop_assert!(max - min <= 1);
        // Larger slots come first.
        prop_assert!(sizes.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn assignment_preserves_host_order(hosts in 0..30usize, fields in 1..6usize) {
        let text: String = (0..fields).map(|i| format!("ROLE{}_HOSTS=\"\"\n", char::from(b'A' + i as u8))).collect();
        let host_list: Vec<String> = (0..hosts).map(|i| format!("10.0.0.{i}")).collect();

        let assignment = assign_hosts(&text, &host_list).unwrap();

        let flattened: Vec<String> = assignment.into_iter().flat_map(|(_, hosts)| hosts).collect();
        prop_assert_eq!(flattened, host_list);
    }

    #[test]
    fn expansion_yields_one_replica_per_combination(
        (cfg, dimension_sizes, replicas, completed) in matrix_config_strategy()
    ) {
        let expanded = expand_tests(&cfg, &CompletionIndex::new()).unwrap();

        let combinations: usize = dimension_sizes.iter().product();
        let per_combination = replicas.saturating_sub(completed) as usize;
        prop_assert_eq!(expanded.len(), combinations * per_combination);

        let unique: HashSet<&str> = expanded.iter().map(|r| r.id.as_str()).collect();
        prop_assert_eq!(unique.len(), expanded.len());

        for replica in &expanded {
            prop_assert!(replica.replica >= completed);
            prop_assert!(replica.replica < replicas);
            let suffix = replica.id.rsplit('-').next().unwrap();
            prop_assert_eq!(suffix.len(), 2);
            prop_assert_eq!(replica.matrix.is_some(), !dimension_sizes.is_empty());
        }
    }

    #[test]
    fn expansion_is_deterministic((cfg, _, _, _) in matrix_config_strategy()) {
        let first = expand_tests(&cfg, &CompletionIndex::new()).unwrap();
        let second = expand_tests(&cfg, &CompletionIndex::new()).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn completed_archives_are_never_rescheduled(
        replicas in 1..=20u32,
        done in proptest::collection::btree_set(0..20u32, 0..10),
    ) {
        let cfg = ConfigFileBuilder::new()
            .with_test(TestSetBuilder::new("c", "exp").replicas(replicas).build())
            .build();
        let mut completion = CompletionIndex::new();
        for index in &done {
            completion.insert("c", *index);
        }

        let expanded = expand_tests(&cfg, &completion).unwrap();

        for replica in &expanded {
            prop_assert!(!done.contains(&replica.replica));
        }
        let still_due = (0..replicas).filter(|i| !done.contains(i)).count();
        prop_assert_eq!(expanded.len(), still_due);
    }
}
