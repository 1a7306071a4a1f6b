// Test modules for Portforwarded
// Each module covers the corresponding source module; helpers holds the mock gateway

mod config_tests;
mod helpers;
