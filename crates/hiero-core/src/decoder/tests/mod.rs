pub(crate) mod testutil;
