// Device integration tests

mod coordinator_test;
