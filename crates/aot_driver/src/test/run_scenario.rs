use aot_autograd::OutputType;

use crate::cli::CompileOptions;
use crate::scenarios;

pub fn check_scenario(
    name: &str,
    options: CompileOptions,
    expected_outputs: &[OutputType],
    expected_graphs: &[&str],
) {
    let _ = env_logger::builder().is_test(true).try_init();

    let scenario = scenarios::find(name).expect("Scenario should exist");
    let outcome = scenarios::run_scenario(scenario, options, None).expect("Compilation failed");

    assert!(
        outcome.mismatch.is_none(),
        "Scenario '{}' disagrees with eager execution: {}",
        name,
        outcome.mismatch.unwrap_or_default()
    );

    let outputs: Vec<OutputType> = outcome
        .meta
        .output_info
        .iter()
        .map(|info| info.output_type)
        .collect();
    assert_eq!(outputs, expected_outputs, "output classification of '{}'", name);

    assert!(
        outcome.graphs.len() == expected_graphs.len()
            && outcome
                .graphs
                .iter()
                .zip(expected_graphs)
                .all(|(graph, kind)| graph.contains(&format!("_{}_", kind))),
        r#"Compiled graphs did not match expectations:
            found:    {:?}
            expected: {:?}"#,
        outcome.graphs,
        expected_graphs,
    );
}

macro_rules! scenario {
    (
        $name:ident $scenario:expr ;
        $( keep_input_mutations = $keep:expr ; )?
        $( unsafe_view_outputs = $unsafe_view:expr ; )?
        outputs = [ $( $output:ident ),* $(,)? ] ;
        graphs = [ $( $graph:expr ),* $(,)? ] ;
    ) => {
        #[test]
        fn $name() {
            #[allow(unused_mut)]
            let mut options = crate::cli::CompileOptions::default();
            $(
                options.keep_input_mutations = $keep;
            )?
            $(
                options.unsafe_view_outputs = $unsafe_view;
            )?

            crate::test::run_scenario::check_scenario(
                $scenario,
                options,
                &[ $( aot_autograd::OutputType::$output ),* ],
                &[ $( $graph ),* ],
            );
        }
    };
}
