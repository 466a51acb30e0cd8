// avhub: Workspace root.
// The cross-crate integration suites live in tests/integration/; the
// library crates live under crates/ and the daemon under services/hubd.
