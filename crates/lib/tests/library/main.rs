mod common;
mod eval_tests;
mod merge_tests;
mod reconcile_tests;
