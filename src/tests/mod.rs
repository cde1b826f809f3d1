mod psref_tests;
mod variant_tests;
