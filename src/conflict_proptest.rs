//! Property-based tests for conflict parsing and JSON merging.

#[cfg(test)]
mod proptest_tests {
    use crate::codeflow::FlowDirection;
    use crate::conflict::parse_conflicted_files;
    use crate::merge::json::merge_json_contents;
    use proptest::prelude::*;

    fn relative_path() -> impl Strategy<Value = String> {
        "[a-z]{1,8}(/[a-z]{1,8}){0,3}\\.(cs|json|props)"
    }

    fn version() -> impl Strategy<Value = String> {
        "[0-9]{1,2}\\.[0-9]{1,2}\\.[0-9]{1,3}"
    }

    // ============================================================================
    // parse_conflicted_files property tests
    // ============================================================================

    proptest! {
        /// Forward flow conflicts are reported relative to the repository
        #[test]
        fn forward_conflicts_lose_mapping_prefix(path in relative_path()) {
            let message = format!("error: src/runtime/{}: patch does not apply", path);
            let files = parse_conflicted_files(&message, FlowDirection::Forward, "runtime").unwrap();
            prop_assert_eq!(files, vec![path]);
        }

        /// Backflow conflicts are reported relative to the VMR
        #[test]
        fn backflow_conflicts_gain_mapping_prefix(path in relative_path()) {
            let message = format!("CONFLICT (content): Merge conflict in {}", path);
            let files = parse_conflicted_files(&message, FlowDirection::Backflow, "runtime").unwrap();
            prop_assert_eq!(files, vec![format!("src/runtime/{}", path)]);
        }

        /// Every file is listed once, however many lines mention it
        #[test]
        fn conflicted_files_are_deduplicated(path in relative_path(), repeats in 1usize..5) {
            let line = format!("error: patch failed: src/runtime/{}:12\nerror: src/runtime/{}: patch does not apply\n", path, path);
            let message = line.repeat(repeats);
            let files = parse_conflicted_files(&message, FlowDirection::Forward, "runtime").unwrap();
            prop_assert_eq!(files.len(), 1);
        }

        /// Text without a known failure phrasing names no files
        #[test]
        fn unrelated_output_has_no_conflicts(message in "[a-zA-Z .]{0,60}") {
            let files = parse_conflicted_files(&message, FlowDirection::Forward, "runtime").unwrap();
            prop_assert!(files.is_empty());
        }
    }

    // ============================================================================
    // merge_json_contents property tests
    // ============================================================================

    proptest! {
        /// A value only the source changed ends up in the merged document
        #[test]
        fn source_only_change_is_applied(before in version(), after in version()) {
            let previous = format!("{{ \"sdk\": {{ \"version\": \"{}\" }} }}", before);
            let current = format!("{{ \"sdk\": {{ \"version\": \"{}\" }} }}", after);

            let merged = merge_json_contents(Some(&previous), Some(&previous), Some(&previous), Some(&current)).unwrap();
            let merged: serde_json::Value = serde_json::from_str(&merged).unwrap();
            prop_assert_eq!(merged["sdk"]["version"].as_str(), Some(after.as_str()));
        }

        /// Without source changes the target document is kept as is
        #[test]
        fn unchanged_source_keeps_target(source in version(), target in version()) {
            let source = format!("{{ \"tools\": {{ \"dotnet\": \"{}\" }} }}", source);
            let target = format!("{{ \"tools\": {{ \"dotnet\": \"{}\" }} }}", target);

            let merged = merge_json_contents(Some(&source), Some(&target), Some(&source), Some(&source)).unwrap();
            let merged: serde_json::Value = serde_json::from_str(&merged).unwrap();
            let expected: serde_json::Value = serde_json::from_str(&target).unwrap();
            prop_assert_eq!(merged, expected);
        }

        /// The merged document is always pretty printed with a final newline
        #[test]
        fn merged_document_ends_with_newline(value in version()) {
            let current = format!("{{ \"version\": \"{}\" }}", value);
            let merged = merge_json_contents(None, None, None, Some(&current)).unwrap();
            prop_assert!(merged.ends_with("}\n"), "missing final newline: {:?}", merged);
        }
    }
}
