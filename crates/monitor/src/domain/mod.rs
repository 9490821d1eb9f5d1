pub mod pu_management;
