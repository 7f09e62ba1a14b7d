// Recovery integration tests

mod kind_test;
