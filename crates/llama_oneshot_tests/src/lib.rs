//! Test harness for [`llama_oneshot`].
//!
//! Most of these tests expect one or more `llama.cpp`-compatible GGUF models to be made
//! available in a directory specified in the `LLAMA_CPP_TEST_MODELS` environment variable. They
//! pass without doing anything when it isn't set.
